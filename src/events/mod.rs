use std::sync::Arc;

use sea_orm::{DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{customer, order, OrderStatus};
use crate::notifications::Notifier;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of returning the failure. Event
    /// delivery is best-effort; the emitting request has already committed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            error!("Failed to send event: {}", e);
        }
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, item_id: Uuid },
    CartItemUpdated { cart_id: Uuid, item_id: Uuid },
    CartItemRemoved { cart_id: Uuid, item_id: Uuid },
    CartCleared(Uuid),

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCanceled(Uuid),
    OrderShipped(Uuid),
    OrderDelivered(Uuid),
    OrderDeleted(Uuid),

    // Payment events
    PaymentConfirmed {
        order_id: Uuid,
        transaction_id: Option<String>,
    },
    PaymentFailed {
        order_id: Uuid,
        transaction_id: Option<String>,
    },

    // Checkout events
    CheckoutCompleted { cart_id: Uuid, order_id: Uuid },

    // Customer events
    CustomerCreated(Uuid),
}

// Function to process incoming events and distribute them to their handlers.
// Runs until every EventSender is dropped.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    db: Arc<DatabaseConnection>,
    notifier: Arc<dyn Notifier>,
) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        info!("Received event: {:?}", event);

        match event {
            Event::PaymentConfirmed {
                order_id,
                ref transaction_id,
            } => {
                if let Err(e) = handle_payment_confirmed(
                    &db,
                    notifier.as_ref(),
                    order_id,
                    transaction_id.as_deref(),
                )
                .await
                {
                    error!(
                        "Failed to handle payment confirmation: order_id={}, error={}",
                        order_id, e
                    );
                }
            }
            Event::PaymentFailed { order_id, .. } => {
                warn!("Payment failed for order {}", order_id);
            }
            Event::OrderShipped(order_id) => {
                if let Err(e) =
                    handle_order_shipped(&db, notifier.as_ref(), order_id).await
                {
                    error!(
                        "Failed to handle order shipped event: order_id={}, error={}",
                        order_id, e
                    );
                }
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    "Order {} moved from {} to {}",
                    order_id, old_status, new_status
                );
            }
            _ => {
                info!("No specific handler for event: {:?}", event);
            }
        }
    }

    warn!("Event processing loop has ended");
}

// Handler functions for specific events

async fn handle_payment_confirmed(
    db: &DatabaseConnection,
    notifier: &dyn Notifier,
    order_id: Uuid,
    transaction_id: Option<&str>,
) -> Result<(), String> {
    let (order, customer) = load_order_with_customer(db, order_id).await?;

    let message = match transaction_id {
        Some(txid) => format!(
            "Payment for order {} was received (transaction {}). We are preparing your shipment.",
            order.order_number, txid
        ),
        None => format!(
            "Payment for order {} was received. We are preparing your shipment.",
            order.order_number
        ),
    };
    notifier
        .notify(&customer.email, &message)
        .await
        .map_err(|e| e.to_string())
}

async fn handle_order_shipped(
    db: &DatabaseConnection,
    notifier: &dyn Notifier,
    order_id: Uuid,
) -> Result<(), String> {
    let (order, customer) = load_order_with_customer(db, order_id).await?;

    let message = match order.tracking_number.as_deref() {
        Some(tracking) => format!(
            "Order {} has shipped. Track it with {}.",
            order.order_number, tracking
        ),
        None => format!("Order {} has shipped.", order.order_number),
    };
    notifier
        .notify(&customer.email, &message)
        .await
        .map_err(|e| e.to_string())
}

async fn load_order_with_customer(
    db: &DatabaseConnection,
    order_id: Uuid,
) -> Result<(order::Model, customer::Model), String> {
    let order = order::Entity::find_by_id(order_id)
        .one(db)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Order {} not found", order_id))?;

    let customer = customer::Entity::find_by_id(order.customer_id)
        .one(db)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Customer {} not found", order.customer_id))?;

    Ok((order, customer))
}
