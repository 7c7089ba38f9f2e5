mod common;

use axum::http::Method;
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn create_and_fetch_an_empty_cart() {
    let app = TestApp::new().await;

    let response = app
        .request_public(Method::POST, "/api/v1/carts", None)
        .await;
    assert_eq!(response.status(), 201);
    let cart = response_json(response).await;
    let token = cart["token"].as_str().unwrap();
    assert!(!token.is_empty());

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["cart"]["token"], *token);
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn fetching_an_unknown_cart_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .request_public(Method::GET, "/api/v1/carts/never-issued", None)
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn repeated_adds_merge_into_one_line() {
    let app = TestApp::new().await;
    let product = app.seed_product("Steel dice set", dec!(15.00), 10).await;
    let bundle = app
        .seed_bundle("Game night bundle", dec!(40.00), 10)
        .await;
    let token = app.cart_with_product(product.id, 2).await;

    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": product.id, "quantity": 3 })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 5);

    // A bundle is a distinct line even when ids could collide.
    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": bundle.id, "is_bundle": true, "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn carting_beyond_stock_is_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product("Leather keyring", dec!(8.00), 4).await;
    let token = app.cart_with_product(product.id, 3).await;

    // 3 in the cart, 2 more would exceed the 4 on hand.
    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": product.id, "quantity": 2 })),
        )
        .await;
    assert_eq!(response.status(), 422);

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    let body = response_json(response).await;
    assert_eq!(body["items"][0]["quantity"], 3, "the line is unchanged");
}

#[tokio::test]
async fn add_item_validates_its_input() {
    let app = TestApp::new().await;
    let product = app.seed_product("Bamboo coasters", dec!(12.00), 10).await;

    let response = app
        .request_public(Method::POST, "/api/v1/carts", None)
        .await;
    let token = response_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": product.id, "quantity": 0 })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": uuid::Uuid::new_v4(), "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), 404);

    app.set_product(product.id, None, Some(false)).await;
    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": product.id, "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn quantity_updates_replace_and_zero_removes() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cork placemats", dec!(10.00), 10).await;
    let token = app.cart_with_product(product.id, 2).await;

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    let body = response_json(response).await;
    let line_id = body["items"][0]["id"].as_str().unwrap().to_string();

    let response = app
        .request_public(
            Method::PUT,
            &format!("/api/v1/carts/{}/items/{}", token, line_id),
            Some(json!({ "quantity": 7 })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["items"][0]["quantity"], 7);

    // More than the shelf holds.
    let response = app
        .request_public(
            Method::PUT,
            &format!("/api/v1/carts/{}/items/{}", token, line_id),
            Some(json!({ "quantity": 11 })),
        )
        .await;
    assert_eq!(response.status(), 422);

    let response = app
        .request_public(
            Method::PUT,
            &format!("/api/v1/carts/{}/items/{}", token, line_id),
            Some(json!({ "quantity": 0 })),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn lines_are_scoped_to_their_cart() {
    let app = TestApp::new().await;
    let product = app.seed_product("Pocket level", dec!(9.00), 10).await;
    let token = app.cart_with_product(product.id, 1).await;

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    let line_id = response_json(response).await["items"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request_public(Method::POST, "/api/v1/carts", None)
        .await;
    let other_token = response_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request_public(
            Method::DELETE,
            &format!("/api/v1/carts/{}/items/{}", other_token, line_id),
            None,
        )
        .await;
    assert_eq!(response.status(), 404);

    // The line is still on its own cart.
    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    let body = response_json(response).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn removing_a_line_and_deleting_the_cart() {
    let app = TestApp::new().await;
    let product = app.seed_product("Brass bookmark", dec!(6.00), 10).await;
    let token = app.cart_with_product(product.id, 1).await;

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    let line_id = response_json(response).await["items"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request_public(
            Method::DELETE,
            &format!("/api/v1/carts/{}/items/{}", token, line_id),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 0);

    let response = app
        .request_public(Method::DELETE, &format!("/api/v1/carts/{}", token), None)
        .await;
    assert_eq!(response.status(), 204);

    let response = app
        .request_public(Method::GET, &format!("/api/v1/carts/{}", token), None)
        .await;
    assert_eq!(response.status(), 404);

    let response = app
        .request_public(
            Method::POST,
            &format!("/api/v1/carts/{}/items", token),
            Some(json!({ "item_id": product.id, "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), 404);
}
