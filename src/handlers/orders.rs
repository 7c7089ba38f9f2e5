use crate::handlers::common::{
    no_content_response, require_admin, success_response, validate_input, PaginatedResponse,
    PaginationParams,
};
use crate::{
    entities::{order, Currency, OrderStatus, PaymentMethod},
    errors::ServiceError,
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for order endpoints. `GET /{id}` is the public
/// status-polling endpoint; everything else is guarded by the admin token.
pub fn orders_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_orders))
        .route("/{id}", get(get_order))
        .route("/{id}", delete(delete_order))
        .route("/{id}/accept", post(accept_order))
        .route("/{id}/ship", post(ship_order))
        .route("/{id}/deliver", post(deliver_order))
        .route("/{id}/cancel", post(cancel_order))
        .route("/{id}/payment-link", post(reissue_payment_link))
        .route("/expire-stale", post(expire_stale_payments))
}

/// Public order status for client polling
async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let order = state.services.orders.get(id).await?;
    Ok(success_response(OrderStatusResponse::from(order)))
}

/// List orders, optionally narrowed to one status
async fn list_orders(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter>,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let (orders, total) = state
        .services
        .orders
        .list(filter.status, pagination.page, pagination.per_page)
        .await?;

    Ok(success_response(PaginatedResponse::new(
        orders,
        pagination.page,
        pagination.per_page,
        total,
    )))
}

/// Accept a paid order for fulfillment, assigning its tracking number
async fn accept_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptOrderRequest>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;
    validate_input(&payload)?;

    let order = state
        .services
        .orders
        .accept(id, &payload.tracking_number)
        .await?;
    Ok(success_response(order))
}

/// Mark an accepted order as shipped
async fn ship_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let order = state.services.orders.mark_shipped(id).await?;
    Ok(success_response(order))
}

/// Mark a shipped order as delivered
async fn deliver_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let order = state.services.orders.mark_delivered(id).await?;
    Ok(success_response(order))
}

/// Cancel an order from any non-terminal state, releasing its stock
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelOrderRequest>>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let reason = payload.and_then(|Json(p)| p.reason);
    let order = state
        .services
        .orders
        .cancel(id, reason.as_deref())
        .await?;
    Ok(success_response(order))
}

/// Delete an order that never reached fulfillment
async fn delete_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    state.services.orders.delete(id).await?;
    Ok(no_content_response())
}

/// Re-issue the hosted payment URL for an order awaiting payment
async fn reissue_payment_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let handoff = state.services.checkout.payment_link(id).await?;
    Ok(success_response(handoff))
}

/// Cancel orders whose payment window lapsed and reclaim failed-payment stock
async fn expire_stale_payments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    require_admin(&state.config, &headers)?;

    let summary = state
        .services
        .orders
        .expire_stale_payments(Utc::now())
        .await?;
    Ok(success_response(summary))
}

// Request/response DTOs

#[derive(Debug, Deserialize)]
pub struct StatusFilter {
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AcceptOrderRequest {
    #[validate(length(min = 1, message = "Tracking number is required"))]
    pub tracking_number: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// Client-facing order view: enough to poll payment and fulfillment
/// progress, nothing internal.
#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub currency: Currency,
    pub total: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<order::Model> for OrderStatusResponse {
    fn from(order: order::Model) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_method: order.payment_method,
            currency: order.currency,
            total: order.total,
            transaction_id: order.provider_transaction_id,
            tracking_number: order.tracking_number,
            delivered_at: order.delivered_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}
