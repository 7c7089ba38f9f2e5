mod common;

use axum::http::Method;
use common::{checkout_payload, response_json, TestApp, CALLBACK_TOKEN};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::OrderStatus;
use uuid::Uuid;

/// Places a gateway order and returns its id and payment reference.
async fn gateway_order(app: &TestApp, stock: i32, quantity: i32) -> (Uuid, String) {
    let product = app.seed_product("Field notebook", dec!(12.00), stock).await;
    let token = app.cart_with_product(product.id, quantity).await;

    let response = app
        .request_public(
            Method::POST,
            "/api/v1/checkout",
            Some(checkout_payload(&token, "gateway")),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = response_json(response).await;

    let order_id: Uuid = body["order_id"].as_str().unwrap().parse().unwrap();
    let reference = app.order_row(order_id).await.payment_reference;
    (order_id, reference)
}

#[tokio::test]
async fn settled_webhook_confirms_order_and_notifies_once() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-1001",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");

    let order = app.order_row(order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.provider_transaction_id.as_deref(), Some("tx-1001"));

    app.settle_events().await;
    assert_eq!(app.notices.count_containing("was received"), 1);
    assert_eq!(app.notices.count_containing("tx-1001"), 1);
}

#[tokio::test]
async fn replayed_webhook_is_acknowledged_without_side_effects() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let payload = json!({
        "transaction_id": "tx-2002",
        "status": "settled",
        "reference": reference,
    });

    let response = app.post_callback(payload.clone()).await;
    assert_eq!(response_json(response).await["status"], "ok");

    let response = app.post_callback(payload).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["status"], "already_processed");

    assert_eq!(app.order_row(order_id).await.status, OrderStatus::Pending);
    app.settle_events().await;
    assert_eq!(app.notices.count_containing("was received"), 1);
}

#[tokio::test]
async fn callbacks_require_the_shared_token() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let payload = json!({
        "transaction_id": "tx-3003",
        "status": "settled",
        "reference": reference,
    });

    let response = app
        .request_public(Method::POST, "/api/v1/payments/callback", Some(payload.clone()))
        .await;
    assert_eq!(response.status(), 401);

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/callback",
            Some(payload),
            Some("not-the-registered-token"),
        )
        .await;
    assert_eq!(response.status(), 401);

    let response = app
        .request_public(
            Method::GET,
            &format!("/api/v1/payments/return?reference={}", reference),
            None,
        )
        .await;
    assert_eq!(response.status(), 401);

    // Nothing moved.
    assert_eq!(
        app.order_row(order_id).await.status,
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn malformed_webhooks_are_rejected() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .post_callback(json!({ "status": "settled", "reference": reference }))
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("transaction_id"));

    let response = app
        .post_callback(json!({ "transaction_id": "tx-4004", "reference": reference }))
        .await;
    assert_eq!(response.status(), 400);

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-4004",
            "status": "refunded",
            "reference": reference,
        }))
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("refunded"));

    assert_eq!(
        app.order_row(order_id).await.status,
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn callback_matching_no_order_is_not_found() {
    let app = TestApp::new().await;
    gateway_order(&app, 10, 1).await;

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-5005",
            "status": "settled",
            "reference": "PAY-ffffffffffffffffffffffffffffffff",
        }))
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn failed_webhook_marks_order_failed_and_keeps_the_hold() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let payload = json!({
        "transaction_id": "tx-6006",
        "status": "failed",
        "reference": reference,
    });
    let response = app.post_callback(payload.clone()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["status"], "ok");

    let failed = app.order_row(order_id).await;
    assert_eq!(failed.status, OrderStatus::PaymentFailed);
    assert_eq!(failed.provider_transaction_id.as_deref(), Some("tx-6006"));
    assert!(
        failed.stock_released_at.is_none(),
        "the hold stays while a retry window is open"
    );

    let response = app.post_callback(payload).await;
    assert_eq!(response_json(response).await["status"], "already_processed");

    app.settle_events().await;
    assert_eq!(app.notices.count_containing("was received"), 0);
}

#[tokio::test]
async fn settlement_after_failure_is_ignored() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-7007",
            "status": "failed",
            "reference": reference,
        }))
        .await;
    assert_eq!(response_json(response).await["status"], "ok");

    // A success racing in after the failure verdict does not resurrect it.
    let response = app
        .post_callback(json!({
            "transaction_id": "tx-7007",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["status"], "ignored");

    assert_eq!(
        app.order_row(order_id).await.status,
        OrderStatus::PaymentFailed
    );
}

#[tokio::test]
async fn redirect_with_reference_confirms_without_transaction_id() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .request_public(
            Method::GET,
            &format!(
                "/api/v1/payments/return?token={}&reference={}",
                CALLBACK_TOKEN, reference
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["status"], "ok");

    let order = app.order_row(order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.provider_transaction_id, None);
}

#[tokio::test]
async fn parameterless_redirect_falls_back_to_latest_pending_order() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .request_public(
            Method::GET,
            &format!("/api/v1/payments/return?token={}", CALLBACK_TOKEN),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["status"], "ok");

    let order = app.order_row(order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(
        order.notes.contains("parameterless redirect"),
        "the loose match is written into the audit trail"
    );

    // The provider's webhook lands later and back-fills the transaction id.
    let response = app
        .post_callback(json!({
            "transaction_id": "tx-8008",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response_json(response).await["status"], "already_processed");
    assert_eq!(
        app.order_row(order_id).await.provider_transaction_id.as_deref(),
        Some("tx-8008")
    );

    app.settle_events().await;
    assert_eq!(app.notices.count_containing("was received"), 1);
}

#[tokio::test]
async fn parameterless_redirect_targets_the_most_recent_pending_order() {
    let app = TestApp::new().await;
    let (first_id, _) = gateway_order(&app, 10, 1).await;
    let (second_id, _) = gateway_order(&app, 10, 1).await;

    let response = app
        .request_public(
            Method::GET,
            &format!("/api/v1/payments/return?token={}", CALLBACK_TOKEN),
            None,
        )
        .await;
    assert_eq!(response_json(response).await["status"], "ok");

    assert_eq!(app.order_row(second_id).await.status, OrderStatus::Pending);
    assert_eq!(
        app.order_row(first_id).await.status,
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn callbacks_for_canceled_orders_are_ignored() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cast iron trivet", dec!(18.00), 10).await;
    let token = app.cart_with_product(product.id, 2).await;

    let response = app
        .request_public(
            Method::POST,
            "/api/v1/checkout",
            Some(checkout_payload(&token, "gateway")),
        )
        .await;
    let body = response_json(response).await;
    let order_id: Uuid = body["order_id"].as_str().unwrap().parse().unwrap();
    let reference = app.order_row(order_id).await.payment_reference;

    let response = app
        .request_admin(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            Some(json!({ "reason": "shopper asked to cancel" })),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(app.product_stock(product.id).await, 10);

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-9009",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response_json(response).await["status"], "ignored");

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-9009",
            "status": "failed",
            "reference": reference,
        }))
        .await;
    assert_eq!(response_json(response).await["status"], "ignored");

    // Cancellation released the hold exactly once.
    assert_eq!(app.product_stock(product.id).await, 10);
    assert_eq!(app.order_row(order_id).await.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn conflicting_transaction_ids_are_rejected() {
    let app = TestApp::new().await;
    let (order_id, reference) = gateway_order(&app, 10, 1).await;

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-aaaa",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response_json(response).await["status"], "ok");

    let response = app
        .post_callback(json!({
            "transaction_id": "tx-bbbb",
            "status": "settled",
            "reference": reference,
        }))
        .await;
    assert_eq!(response.status(), 409);

    assert_eq!(
        app.order_row(order_id).await.provider_transaction_id.as_deref(),
        Some("tx-aaaa")
    );
}
