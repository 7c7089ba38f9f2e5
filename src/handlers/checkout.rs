use crate::handlers::common::{created_response, validate_input};
use crate::{errors::ServiceError, services::checkout::CheckoutInput, AppState};
use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use std::sync::Arc;

/// Creates the router for the checkout endpoint
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(checkout))
}

/// Turn the cart into an order
async fn checkout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckoutInput>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let output = state.services.checkout.checkout(payload).await?;
    Ok(created_response(output))
}
