use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entities::{bundle, product};
use crate::errors::ServiceError;

/// Stock ledger over the `products` and `bundles` tables.
///
/// Every decrement is a single conditional UPDATE guarding on the current
/// count, so concurrent checkouts contend at the row and the database picks
/// exactly one winner for the last unit. Counts never go negative.
#[derive(Clone)]
pub struct StockService {
    db: Arc<DatabaseConnection>,
}

impl StockService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Atomically takes `quantity` units from the item's stock.
    ///
    /// Fails with `InsufficientStock` and no side effects when fewer units
    /// are on hand, and `NotFound` when the item does not exist.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        item_id: Uuid,
        is_bundle: bool,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        self.reserve_on(&*self.db, item_id, is_bundle, quantity)
            .await
    }

    /// Transaction-aware variant of [`reserve`](Self::reserve).
    pub async fn reserve_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        item_id: Uuid,
        is_bundle: bool,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::validation("Quantity must be positive"));
        }

        let rows = if is_bundle {
            bundle::Entity::update_many()
                .col_expr(
                    bundle::Column::Stock,
                    Expr::col(bundle::Column::Stock).sub(quantity),
                )
                .col_expr(bundle::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(bundle::Column::Id.eq(item_id))
                .filter(bundle::Column::Stock.gte(quantity))
                .exec(conn)
                .await?
                .rows_affected
        } else {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(item_id))
                .filter(product::Column::Stock.gte(quantity))
                .exec(conn)
                .await?
                .rows_affected
        };

        if rows == 0 {
            // Zero rows means the guard failed; a follow-up read says which
            // way. NotFound bubbles from available_on when the row is gone.
            let available = self.available_on(conn, item_id, is_bundle).await?;
            warn!(
                "Insufficient stock for {} {}: requested {}, available {}",
                kind(is_bundle),
                item_id,
                quantity,
                available
            );
            return Err(ServiceError::InsufficientStock(format!(
                "{} {}: requested {}, available {}",
                kind(is_bundle),
                item_id,
                quantity,
                available
            )));
        }

        Ok(())
    }

    /// Hands `quantity` units back to the item's stock.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        item_id: Uuid,
        is_bundle: bool,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        self.release_on(&*self.db, item_id, is_bundle, quantity)
            .await
    }

    /// Transaction-aware variant of [`release`](Self::release).
    pub async fn release_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        item_id: Uuid,
        is_bundle: bool,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::validation("Quantity must be positive"));
        }

        let rows = if is_bundle {
            bundle::Entity::update_many()
                .col_expr(
                    bundle::Column::Stock,
                    Expr::col(bundle::Column::Stock).add(quantity),
                )
                .col_expr(bundle::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(bundle::Column::Id.eq(item_id))
                .exec(conn)
                .await?
                .rows_affected
        } else {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(item_id))
                .exec(conn)
                .await?
                .rows_affected
        };

        if rows == 0 {
            return Err(ServiceError::not_found(format!(
                "{} {}",
                kind(is_bundle),
                item_id
            )));
        }

        Ok(())
    }

    /// Current on-hand count for an item.
    #[instrument(skip(self))]
    pub async fn available(&self, item_id: Uuid, is_bundle: bool) -> Result<i32, ServiceError> {
        self.available_on(&*self.db, item_id, is_bundle).await
    }

    /// Transaction-aware variant of [`available`](Self::available).
    pub async fn available_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        item_id: Uuid,
        is_bundle: bool,
    ) -> Result<i32, ServiceError> {
        let stock = if is_bundle {
            bundle::Entity::find_by_id(item_id)
                .one(conn)
                .await?
                .map(|b| b.stock)
        } else {
            product::Entity::find_by_id(item_id)
                .one(conn)
                .await?
                .map(|p| p.stock)
        };

        stock.ok_or_else(|| ServiceError::not_found(format!("{} {}", kind(is_bundle), item_id)))
    }
}

fn kind(is_bundle: bool) -> &'static str {
    if is_bundle {
        "bundle"
    } else {
        "product"
    }
}
