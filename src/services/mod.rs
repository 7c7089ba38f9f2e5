// Core services
pub mod carts;
pub mod checkout;
pub mod gateway;
pub mod orders;
pub mod reconciliation;
pub mod stock;
