use crate::handlers::common::{bearer_token, success_response};
use crate::{
    errors::ServiceError,
    services::reconciliation::{CallbackChannel, CallbackNotification},
    AppState,
};
use axum::{
    extract::{Json, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Creates the router for the provider notification endpoints
pub fn payments_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/callback", post(payment_callback))
        .route("/return", get(payment_return))
}

/// Server-to-server provider webhook
async fn payment_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CallbackRequest>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    state
        .services
        .reconciliation
        .verify_token(bearer_token(&headers))?;

    let outcome = state
        .services
        .reconciliation
        .process(CallbackNotification {
            channel: CallbackChannel::Webhook,
            transaction_id: payload.transaction_id,
            status: payload.status,
            reference: payload.reference,
        })
        .await?;

    Ok(success_response(CallbackAck {
        status: outcome.as_str(),
    }))
}

/// Shopper's browser returning from the hosted payment page. Providers are
/// inconsistent about what they append past the registered token, so all
/// parameters are optional.
async fn payment_return(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReturnParams>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    state
        .services
        .reconciliation
        .verify_token(params.token.as_deref())?;

    let outcome = state
        .services
        .reconciliation
        .process(CallbackNotification {
            channel: CallbackChannel::Redirect,
            transaction_id: params.transaction_id,
            status: params.status,
            reference: params.reference,
        })
        .await?;

    Ok(success_response(CallbackAck {
        status: outcome.as_str(),
    }))
}

// Request/response DTOs

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnParams {
    pub token: Option<String>,
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub status: &'static str,
}
