pub mod bundle;
pub mod cart;
pub mod cart_item;
pub mod customer;
pub mod order;
pub mod order_item;
pub mod product;

pub use order::{Currency, OrderStatus, PaymentMethod};
