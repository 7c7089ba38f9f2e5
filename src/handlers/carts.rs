use crate::handlers::common::{
    created_response, no_content_response, success_response, validate_input,
};
use crate::{
    errors::ServiceError,
    services::carts::{AddToCartInput, UpdateCartItemInput},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_cart))
        .route("/{token}", get(get_cart))
        .route("/{token}", delete(delete_cart))
        .route("/{token}/items", post(add_to_cart))
        .route("/{token}/items/{line_id}", put(update_cart_item))
        .route("/{token}/items/{line_id}", delete(remove_cart_item))
}

/// Create a new cart; the returned token is the only handle to it
async fn create_cart(
    State(state): State<Arc<AppState>>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let cart = state.services.carts.create_cart().await?;
    Ok(created_response(cart))
}

/// Get cart with items
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let cart_with_items = state.services.carts.get_cart(&token).await?;
    Ok(success_response(cart_with_items))
}

/// Add an item to the cart, merging into an existing line for the same item
async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(payload): Json<AddToCartInput>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let cart = state.services.carts.add_item(&token, payload).await?;
    Ok(success_response(cart))
}

/// Update a cart line's quantity; zero removes the line
async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    Path((token, line_id)): Path<(String, Uuid)>,
    Json(payload): Json<UpdateCartItemInput>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .update_item_quantity(&token, line_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

/// Remove a line from the cart
async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    Path((token, line_id)): Path<(String, Uuid)>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let cart = state.services.carts.remove_item(&token, line_id).await?;
    Ok(success_response(cart))
}

/// Delete the cart and everything in it
async fn delete_cart(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    state.services.carts.delete_cart(&token).await?;
    Ok(no_content_response())
}
