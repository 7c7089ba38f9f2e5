use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{bundle, cart, cart_item, product, Currency},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Shopping cart service.
///
/// Carts live server-side and are addressed by an opaque token handed out at
/// creation; the client never supplies its own identifiers. A cart holds at
/// most one line per (item, bundle flag) pair, so repeated adds merge into
/// the existing line. Adding to a cart checks current availability but does
/// not reserve anything; stock is only taken at checkout.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Creates an empty cart and returns it with its access token.
    #[instrument(skip(self))]
    pub async fn create_cart(&self) -> Result<cart::Model, ServiceError> {
        let cart_id = Uuid::new_v4();
        let now = Utc::now();

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            token: Set(Uuid::new_v4().simple().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let cart = cart.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartCreated(cart_id))
            .await;

        info!("Created cart: {}", cart_id);
        Ok(cart)
    }

    /// Retrieves a cart and its lines by token.
    #[instrument(skip(self, token))]
    pub async fn get_cart(&self, token: &str) -> Result<CartWithItems, ServiceError> {
        let cart = find_by_token(&*self.db, token).await?;
        let items = cart.find_related(cart_item::Entity).all(&*self.db).await?;

        Ok(CartWithItems { cart, items })
    }

    /// Adds an item to the cart, merging with an existing line for the same
    /// (item, bundle flag) pair.
    ///
    /// The item must exist, be active, and have at least the merged quantity
    /// on hand right now. The availability check is advisory: nothing is
    /// reserved until checkout, which re-checks atomically.
    #[instrument(skip(self, token))]
    pub async fn add_item(
        &self,
        token: &str,
        input: AddToCartInput,
    ) -> Result<CartWithItems, ServiceError> {
        if input.quantity <= 0 {
            return Err(ServiceError::validation("Quantity must be positive"));
        }

        let txn = self.db.begin().await?;

        let cart = find_by_token(&txn, token).await?;
        let item = load_item(&txn, input.item_id, input.is_bundle).await?;

        if !item.is_active {
            return Err(ServiceError::validation(format!(
                "Item {} is not available for sale",
                input.item_id
            )));
        }

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ItemId.eq(input.item_id))
            .filter(cart_item::Column::IsBundle.eq(input.is_bundle))
            .one(&txn)
            .await?;

        let merged_quantity = existing.as_ref().map_or(0, |line| line.quantity) + input.quantity;

        if item.stock < merged_quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "{} {}: requested {}, available {}",
                if input.is_bundle { "bundle" } else { "product" },
                input.item_id,
                merged_quantity,
                item.stock
            )));
        }

        if let Some(line) = existing {
            let mut line: cart_item::ActiveModel = line.into();
            line.quantity = Set(merged_quantity);
            line.update(&txn).await?;
        } else {
            let line = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                item_id: Set(input.item_id),
                is_bundle: Set(input.is_bundle),
                quantity: Set(input.quantity),
                added_at: Set(Utc::now()),
            };
            line.insert(&txn).await?;
        }

        let cart = touch_cart(&txn, cart).await?;
        let items = cart.find_related(cart_item::Entity).all(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                item_id: input.item_id,
            })
            .await;

        info!(
            "Added item to cart {}: {} x{}",
            cart.id, input.item_id, input.quantity
        );
        Ok(CartWithItems { cart, items })
    }

    /// Sets the quantity of a cart line. A quantity of zero or less removes
    /// the line.
    #[instrument(skip(self, token))]
    pub async fn update_item_quantity(
        &self,
        token: &str,
        line_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_by_token(&txn, token).await?;
        let line = load_line(&txn, &cart, line_id).await?;
        let item_id = line.item_id;

        if quantity <= 0 {
            line.delete(&txn).await?;
        } else {
            let item = load_item(&txn, line.item_id, line.is_bundle).await?;
            if item.stock < quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "{} {}: requested {}, available {}",
                    if line.is_bundle { "bundle" } else { "product" },
                    line.item_id,
                    quantity,
                    item.stock
                )));
            }

            let mut line: cart_item::ActiveModel = line.into();
            line.quantity = Set(quantity);
            line.update(&txn).await?;
        }

        let cart = touch_cart(&txn, cart).await?;
        let items = cart.find_related(cart_item::Entity).all(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(CartWithItems { cart, items })
    }

    /// Removes a cart line.
    #[instrument(skip(self, token))]
    pub async fn remove_item(
        &self,
        token: &str,
        line_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_by_token(&txn, token).await?;
        let line = load_line(&txn, &cart, line_id).await?;

        let item_id = line.item_id;
        line.delete(&txn).await?;

        let cart = touch_cart(&txn, cart).await?;
        let items = cart.find_related(cart_item::Entity).all(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(CartWithItems { cart, items })
    }

    /// Deletes the cart outright, lines and cart row both. Checkout calls
    /// this once the order exists; the token is dead afterwards.
    #[instrument(skip(self, token))]
    pub async fn delete_cart(&self, token: &str) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_by_token(&txn, token).await?;

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        cart::Entity::delete_by_id(cart.id).exec(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartCleared(cart.id))
            .await;

        info!("Deleted cart: {}", cart.id);
        Ok(())
    }
}

/// Looks up a cart by its access token.
pub(crate) async fn find_by_token<C: ConnectionTrait>(
    conn: &C,
    token: &str,
) -> Result<cart::Model, ServiceError> {
    cart::Entity::find()
        .filter(cart::Column::Token.eq(token))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("Cart {}", token)))
}

/// Fetches a line strictly within the given cart. A line id that exists on
/// some other cart reads as not found, the same as one that never existed.
async fn load_line<C: ConnectionTrait>(
    conn: &C,
    cart: &cart::Model,
    line_id: Uuid,
) -> Result<cart_item::Model, ServiceError> {
    cart_item::Entity::find_by_id(line_id)
        .one(conn)
        .await?
        .filter(|line| line.cart_id == cart.id)
        .ok_or_else(|| ServiceError::not_found(format!("Cart line {}", line_id)))
}

async fn touch_cart<C: ConnectionTrait>(
    conn: &C,
    cart: cart::Model,
) -> Result<cart::Model, ServiceError> {
    let mut active: cart::ActiveModel = cart.into();
    active.updated_at = Set(Utc::now());
    Ok(active.update(conn).await?)
}

/// Point-in-time view of a sellable item. Cart validation reads it for
/// availability; checkout freezes `name` and the price into order lines.
#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    pub name: String,
    pub price_usd: Decimal,
    pub price_eur: Decimal,
    pub stock: i32,
    pub is_active: bool,
}

impl ItemSnapshot {
    pub fn price_in(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Usd => self.price_usd,
            Currency::Eur => self.price_eur,
        }
    }
}

/// Loads a product or bundle row into the shared snapshot shape.
pub(crate) async fn load_item<C: ConnectionTrait>(
    conn: &C,
    item_id: Uuid,
    is_bundle: bool,
) -> Result<ItemSnapshot, ServiceError> {
    if is_bundle {
        let b = bundle::Entity::find_by_id(item_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("bundle {}", item_id)))?;
        Ok(ItemSnapshot {
            name: b.name,
            price_usd: b.price_usd,
            price_eur: b.price_eur,
            stock: b.stock,
            is_active: b.is_active,
        })
    } else {
        let p = product::Entity::find_by_id(item_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("product {}", item_id)))?;
        Ok(ItemSnapshot {
            name: p.name,
            price_usd: p.price_usd,
            price_eur: p.price_eur,
            stock: p.stock,
            is_active: p.is_active,
        })
    }
}

/// Input for adding an item to a cart
#[derive(Debug, Deserialize, Validate)]
pub struct AddToCartInput {
    pub item_id: Uuid,
    #[serde(default)]
    pub is_bundle: bool,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

/// Input for changing a cart line's quantity
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateCartItemInput {
    #[validate(range(min = 0, message = "Quantity cannot be negative"))]
    pub quantity: i32,
}

/// Cart with its lines
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}
