use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{cart_item, customer, order, order_item, Currency, OrderStatus, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::{self, CartService},
        gateway::{self, PaymentGatewayService},
        stock::StockService,
    },
};

/// Turns a cart into an order.
///
/// The steps are ordered so that no failure strands state: items are
/// re-validated before anything is written, stock is reserved line by line
/// with reverse-order release on any later failure, and the cart is deleted
/// only once the order row exists. A payment initiation failure leaves the
/// order awaiting payment; the payment link can be re-issued.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    carts: Arc<CartService>,
    stock: Arc<StockService>,
    gateway: Arc<PaymentGatewayService>,
    config: Arc<AppConfig>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        carts: Arc<CartService>,
        stock: Arc<StockService>,
        gateway: Arc<PaymentGatewayService>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            carts,
            stock,
            gateway,
            config,
        }
    }

    #[instrument(skip(self, input), fields(cart_token = %input.cart_token))]
    pub async fn checkout(&self, input: CheckoutInput) -> Result<CheckoutOutput, ServiceError> {
        let cart = self.carts.get_cart(&input.cart_token).await?;
        if cart.items.is_empty() {
            return Err(ServiceError::validation("Cart is empty"));
        }

        let priced = self.price_lines(&cart.items, input.currency).await?;
        let customer = self.upsert_customer(&input).await?;

        let mut reserved: Vec<&cart_item::Model> = Vec::new();
        for line in &cart.items {
            match self
                .stock
                .reserve(line.item_id, line.is_bundle, line.quantity)
                .await
            {
                Ok(()) => reserved.push(line),
                Err(e) => {
                    self.release_reserved(&reserved).await;
                    return Err(e);
                }
            }
        }

        // From here until the order row is committed, every failure has to
        // give the reservation back.
        let order = match self.insert_order(&input, customer.id, &priced).await {
            Ok(order) => order,
            Err(e) => {
                self.release_reserved(&reserved).await;
                return Err(e);
            }
        };

        if let Err(e) = self.carts.delete_cart(&input.cart_token).await {
            warn!(
                "Order {} created but cart {} was not deleted: {}",
                order.id, input.cart_token, e
            );
        }

        self.event_sender
            .send_or_log(Event::OrderCreated(order.id))
            .await;
        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                cart_id: cart.cart.id,
                order_id: order.id,
            })
            .await;

        let payment_url = match input.payment_method {
            PaymentMethod::Gateway => match self.gateway.initiate(&order).await {
                Ok(handoff) => Some(handoff.payment_url),
                Err(e) => {
                    // The order survives; a payment link can be re-issued.
                    warn!(
                        "Order {} created but payment initiation failed: {}",
                        order.id, e
                    );
                    return Err(e);
                }
            },
            PaymentMethod::CashOnDelivery => None,
        };

        info!(
            "Checkout completed: order {} ({}) for {}",
            order.id, order.order_number, customer.email
        );
        Ok(CheckoutOutput {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_url,
        })
    }

    /// Re-issues the hosted payment URL for an order still awaiting payment,
    /// e.g. after a payment initiation failure during checkout.
    #[instrument(skip(self))]
    pub async fn payment_link(
        &self,
        order_id: Uuid,
    ) -> Result<gateway::PaymentHandoff, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Order {}", order_id)))?;

        if order.payment_method != PaymentMethod::Gateway {
            return Err(ServiceError::validation(
                "Order is not paid through the gateway",
            ));
        }
        if order.status != OrderStatus::PendingPayment {
            return Err(ServiceError::Conflict(format!(
                "Order {} is not awaiting payment",
                order_id
            )));
        }

        self.gateway.initiate(&order).await
    }

    /// Re-validates every line against the live catalog and freezes the
    /// name and unit price that will go onto the order.
    async fn price_lines(
        &self,
        lines: &[cart_item::Model],
        currency: Currency,
    ) -> Result<Vec<PricedLine>, ServiceError> {
        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            let snapshot = match carts::load_item(&*self.db, line.item_id, line.is_bundle).await {
                Ok(snapshot) => snapshot,
                Err(ServiceError::NotFound(_)) => {
                    return Err(ServiceError::validation(format!(
                        "Item {} is no longer sold",
                        line.item_id
                    )));
                }
                Err(e) => return Err(e),
            };
            if !snapshot.is_active {
                return Err(ServiceError::validation(format!(
                    "{} is no longer available",
                    snapshot.name
                )));
            }
            priced.push(PricedLine {
                item_id: line.item_id,
                is_bundle: line.is_bundle,
                quantity: line.quantity,
                item_name: snapshot.name.clone(),
                unit_price: snapshot.price_in(currency),
            });
        }
        Ok(priced)
    }

    /// Inserts the customer keyed by email, reusing the existing row on
    /// conflict.
    async fn upsert_customer(&self, input: &CheckoutInput) -> Result<customer::Model, ServiceError> {
        let now = Utc::now();

        let inserted = customer::Entity::insert(customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(input.email.clone()),
            name: Set(input.name.clone()),
            phone: Set(input.phone.clone()),
            is_guest: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::column(customer::Column::Email)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&*self.db)
        .await?;

        let customer = customer::Entity::find()
            .filter(customer::Column::Email.eq(&input.email))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Customer {}", input.email)))?;

        if inserted > 0 {
            self.event_sender
                .send_or_log(Event::CustomerCreated(customer.id))
                .await;
        }

        Ok(customer)
    }

    async fn insert_order(
        &self,
        input: &CheckoutInput,
        customer_id: Uuid,
        priced: &[PricedLine],
    ) -> Result<order::Model, ServiceError> {
        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let subtotal: Decimal = priced
            .iter()
            .map(|p| p.unit_price * Decimal::from(p.quantity))
            .sum();
        let shipping = self.config.shipping_fee(input.currency);
        let discount = Decimal::ZERO;
        let total = subtotal + shipping - discount;

        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number_from(order_id)),
            customer_id: Set(customer_id),
            status: Set(input.payment_method.initial_status()),
            payment_method: Set(input.payment_method),
            currency: Set(input.currency),
            subtotal: Set(subtotal),
            shipping: Set(shipping),
            discount: Set(discount),
            total: Set(total),
            shipping_address: Set(input.shipping_address.clone()),
            payment_reference: Set(gateway::payment_reference(order_id)),
            provider_transaction_id: Set(None),
            tracking_number: Set(None),
            delivered_at: Set(None),
            stock_released_at: Set(None),
            notes: Set(String::new()),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await?;

        let lines: Vec<order_item::ActiveModel> = priced
            .iter()
            .map(|p| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                item_id: Set(p.item_id),
                is_bundle: Set(p.is_bundle),
                item_name: Set(p.item_name.clone()),
                unit_price: Set(p.unit_price),
                quantity: Set(p.quantity),
            })
            .collect();
        order_item::Entity::insert_many(lines).exec(&txn).await?;

        txn.commit().await?;

        Ok(order)
    }

    /// Compensating action: hand back reservations in reverse order.
    async fn release_reserved(&self, reserved: &[&cart_item::Model]) {
        for line in reserved.iter().rev() {
            if let Err(e) = self
                .stock
                .release(line.item_id, line.is_bundle, line.quantity)
                .await
            {
                error!(
                    "Failed to release reserved stock for {} after checkout failure: {}",
                    line.item_id, e
                );
            }
        }
    }
}

fn order_number_from(order_id: Uuid) -> String {
    format!(
        "ORD-{}",
        order_id.simple().to_string()[..8].to_uppercase()
    )
}

struct PricedLine {
    item_id: Uuid,
    is_bundle: bool,
    quantity: i32,
    item_name: String,
    unit_price: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutInput {
    #[validate(length(min = 1, message = "Cart token is required"))]
    pub cart_token: String,
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: String,
    pub phone: Option<String>,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub currency: Currency,
}

#[derive(Debug, Serialize)]
pub struct CheckoutOutput {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
}
