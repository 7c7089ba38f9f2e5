use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order aggregate root.
///
/// Created at checkout and mutated only through the status transitions in
/// [`OrderStatus::can_transition_to`]. `notes` is an append-only audit trail
/// of applied transitions; `version` counts applied writes.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub currency: Currency,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total: Decimal,
    pub shipping_address: String,
    /// Provider-facing reference, derived from `id` (see services::gateway).
    pub payment_reference: String,
    #[sea_orm(nullable, unique)]
    pub provider_transaction_id: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_number: Option<String>,
    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Stamped when reserved stock is handed back; guards exactly-once release.
    #[sea_orm(nullable)]
    pub stock_released_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Text")]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle states.
///
/// `PendingPayment` is the only initial state for gateway-paid orders;
/// cash-on-delivery orders start at `Pending` (confirmed, unfulfilled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "payment_failed")]
    PaymentFailed,
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl OrderStatus {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::PaymentFailed | OrderStatus::Canceled
        )
    }

    /// The full transition table. Cancellation is the only edge shared by
    /// every non-terminal state; everything else moves strictly forward.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if next == Canceled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (PendingPayment, Pending)
                | (PendingPayment, PaymentFailed)
                | (Pending, Processing)
                | (Processing, Shipped)
                | (Shipped, Delivered)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Hosted-redirect gateway; confirmation arrives out of band.
    #[sea_orm(string_value = "gateway")]
    Gateway,
    #[sea_orm(string_value = "cash_on_delivery")]
    CashOnDelivery,
}

impl PaymentMethod {
    /// Initial status for a freshly checked-out order.
    pub fn initial_status(&self) -> OrderStatus {
        match self {
            PaymentMethod::Gateway => OrderStatus::PendingPayment,
            PaymentMethod::CashOnDelivery => OrderStatus::Pending,
        }
    }
}

/// Currency tag carried through the order; the storefront prices every item
/// in both supported currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(3))")]
pub enum Currency {
    #[sea_orm(string_value = "USD")]
    #[serde(rename = "USD")]
    Usd,
    #[sea_orm(string_value = "EUR")]
    #[serde(rename = "EUR")]
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
