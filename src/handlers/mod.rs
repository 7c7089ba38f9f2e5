pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::services::{
    carts::CartService, checkout::CheckoutService, gateway::PaymentGatewayService,
    orders::OrderService, reconciliation::ReconciliationService, stock::StockService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub stock: Arc<StockService>,
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub gateway: Arc<PaymentGatewayService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, ServiceError> {
        let stock = Arc::new(StockService::new(db.clone()));
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let gateway = Arc::new(PaymentGatewayService::new(config.clone())?);
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            stock.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db,
            event_sender,
            carts.clone(),
            stock.clone(),
            gateway.clone(),
            config.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(orders.clone(), config));

        Ok(Self {
            stock,
            carts,
            orders,
            checkout,
            gateway,
            reconciliation,
        })
    }
}
