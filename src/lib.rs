//! Storefront API Library
//!
//! Order lifecycle and payment reconciliation backend: carts, stock
//! reservation, checkout, gateway handoff, and callback reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod notifications;
pub mod services;

use std::sync::Arc;

use axum::Router;
use sea_orm::DatabaseConnection;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
    ) -> Result<Self, errors::ServiceError> {
        let services =
            handlers::AppServices::new(db.clone(), config.clone(), event_sender.clone())?;
        Ok(Self {
            db,
            config,
            event_sender,
            services,
        })
    }
}

/// The versioned API surface, to be nested under `/api/v1`.
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/carts", handlers::carts::carts_routes())
        .nest("/checkout", handlers::checkout::checkout_routes())
        .nest("/orders", handlers::orders::orders_routes())
        .nest("/payments", handlers::payments::payments_routes())
}

/// Full application router: health at the root, everything else versioned.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}
