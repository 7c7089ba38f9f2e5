use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Single sellable product. `stock` is the authoritative purchasable count
/// and is only ever changed through the stock ledger's conditional updates;
/// it must never go negative.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub price_usd: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub price_eur: Decimal,
    pub stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn price_in(&self, currency: super::order::Currency) -> Decimal {
        match currency {
            super::order::Currency::Usd => self.price_usd,
            super::order::Currency::Eur => self.price_eur,
        }
    }
}
