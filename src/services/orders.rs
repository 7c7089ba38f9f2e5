use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{order, order_item, OrderStatus, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock::StockService,
};

/// Order aggregate service.
///
/// Every status change goes through one conditional UPDATE keyed on the
/// expected source status, so concurrent writers contend at the row and at
/// most one applies. The same statement appends the audit note, bumps
/// `version` and refreshes `updated_at`; a rejected transition touches
/// nothing.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    stock: Arc<StockService>,
    config: Arc<AppConfig>,
}

/// Outcome of a payment-driven transition. `AlreadyApplied` is the replay
/// case: the order is already where this callback wanted it.
#[derive(Debug)]
pub enum PaymentTransition {
    Applied(order::Model),
    AlreadyApplied(order::Model),
}

/// Counters returned by the stale-payment sweep.
#[derive(Debug, Default, Serialize)]
pub struct StaleSweepSummary {
    pub canceled: u64,
    pub stock_released: u64,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        stock: Arc<StockService>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            stock,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        get_on(&*self.db, order_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_with_items(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = get_on(&*self.db, order_id).await?;
        let items = order
            .find_related(order_item::Entity)
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    /// Lists orders newest-first, optionally narrowed to one status.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let mut query = order::Entity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query.paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((data, total))
    }

    pub async fn find(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::PaymentReference.eq(reference))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::ProviderTransactionId.eq(transaction_id))
            .one(&*self.db)
            .await?)
    }

    /// Most recent gateway order still awaiting payment. Last-resort lookup
    /// for the identifier-less redirect channel; racy under concurrent
    /// checkouts and only ever used for that channel.
    pub async fn latest_pending_gateway_order(
        &self,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
            .filter(order::Column::PaymentMethod.eq(PaymentMethod::Gateway))
            .order_by_desc(order::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Applies a gateway success: PENDING_PAYMENT -> PENDING plus the
    /// transaction id stamp, in one conditional statement. The transaction
    /// id is optional because the redirect channel can confirm without one;
    /// a later webhook back-fills it via [`Self::attach_transaction_id`].
    ///
    /// The `PaymentConfirmed` event (and with it the customer notification)
    /// is emitted only when this call is the one that applied the
    /// transition, so replays and racing callbacks notify nobody twice.
    #[instrument(skip(self))]
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        transaction_id: Option<&str>,
    ) -> Result<PaymentTransition, ServiceError> {
        let order = self.get(order_id).await?;

        if order.status != OrderStatus::PendingPayment {
            return self.settle_confirmed(order, transaction_id).await;
        }

        let detail = match transaction_id {
            Some(txid) => format!("payment confirmed, transaction {}", txid),
            None => "payment confirmed".to_string(),
        };
        let mut extra = Vec::new();
        if let Some(txid) = transaction_id {
            extra.push((
                order::Column::ProviderTransactionId,
                Expr::value(Some(txid.to_string())),
            ));
        }

        let won = apply_transition(
            &*self.db,
            &order,
            OrderStatus::Pending,
            Some(&detail),
            extra,
        )
        .await?;

        if !won {
            // Lost the race; the fresh row decides whether that is a replay.
            let fresh = self.get(order_id).await?;
            return self.settle_confirmed(fresh, transaction_id).await;
        }

        let updated = self.get(order_id).await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: OrderStatus::PendingPayment,
                new_status: OrderStatus::Pending,
            })
            .await;
        self.event_sender
            .send_or_log(Event::PaymentConfirmed {
                order_id,
                transaction_id: transaction_id.map(str::to_string),
            })
            .await;

        info!(
            "Payment confirmed for order {}: transaction {:?}",
            order_id, transaction_id
        );
        Ok(PaymentTransition::Applied(updated))
    }

    /// Classifies a success notification against an order that is no longer
    /// awaiting payment: replay, back-fillable stamp, identifier conflict,
    /// or an impossible edge.
    async fn settle_confirmed(
        &self,
        order: order::Model,
        transaction_id: Option<&str>,
    ) -> Result<PaymentTransition, ServiceError> {
        match order.status {
            OrderStatus::Pending
            | OrderStatus::Processing
            | OrderStatus::Shipped
            | OrderStatus::Delivered => match transaction_id {
                None => Ok(PaymentTransition::AlreadyApplied(order)),
                Some(txid) if order.provider_transaction_id.as_deref() == Some(txid) => {
                    Ok(PaymentTransition::AlreadyApplied(order))
                }
                Some(txid) if order.provider_transaction_id.is_none() => {
                    // Confirmed without an id (redirect); record it now.
                    match self.attach_transaction_id(order.id, txid).await? {
                        PaymentTransition::Applied(o)
                        | PaymentTransition::AlreadyApplied(o) => {
                            Ok(PaymentTransition::AlreadyApplied(o))
                        }
                    }
                }
                Some(txid) => Err(ServiceError::Conflict(format!(
                    "Transaction {} does not match the one recorded for order {}",
                    txid, order.id
                ))),
            },
            from => Err(ServiceError::InvalidTransition {
                from,
                to: OrderStatus::Pending,
            }),
        }
    }

    /// Applies a gateway failure: PENDING_PAYMENT -> PAYMENT_FAILED. Stock
    /// stays reserved for the retry window; the sweep reclaims it later.
    #[instrument(skip(self))]
    pub async fn fail_payment(
        &self,
        order_id: Uuid,
        transaction_id: Option<&str>,
    ) -> Result<PaymentTransition, ServiceError> {
        let order = self.get(order_id).await?;

        if order.status == OrderStatus::PaymentFailed {
            if let Some(txid) = transaction_id {
                if order.provider_transaction_id.as_deref() != Some(txid) {
                    warn!(
                        "Order {} already failed with transaction {:?}, replay carried {}",
                        order_id, order.provider_transaction_id, txid
                    );
                }
            }
            return Ok(PaymentTransition::AlreadyApplied(order));
        }

        let detail = match transaction_id {
            Some(txid) => format!("payment failed, transaction {}", txid),
            None => "payment failed".to_string(),
        };
        let mut extra = Vec::new();
        if let Some(txid) = transaction_id {
            extra.push((
                order::Column::ProviderTransactionId,
                Expr::value(Some(txid.to_string())),
            ));
        }

        let won = apply_transition(
            &*self.db,
            &order,
            OrderStatus::PaymentFailed,
            Some(&detail),
            extra,
        )
        .await?;

        if !won {
            let fresh = self.get(order_id).await?;
            if fresh.status == OrderStatus::PaymentFailed {
                return Ok(PaymentTransition::AlreadyApplied(fresh));
            }
            return Err(ServiceError::InvalidTransition {
                from: fresh.status,
                to: OrderStatus::PaymentFailed,
            });
        }

        let updated = self.get(order_id).await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: OrderStatus::PendingPayment,
                new_status: OrderStatus::PaymentFailed,
            })
            .await;
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id,
                transaction_id: transaction_id.map(str::to_string),
            })
            .await;

        warn!("Payment failed for order {}", order_id);
        Ok(PaymentTransition::Applied(updated))
    }

    /// Stamps a transaction id onto an order confirmed without one (redirect
    /// fallback), leaving the status alone. Audit-noted.
    #[instrument(skip(self))]
    pub async fn attach_transaction_id(
        &self,
        order_id: Uuid,
        transaction_id: &str,
    ) -> Result<PaymentTransition, ServiceError> {
        let now = Utc::now();
        let note = audit_note(now, &format!("transaction {} attached", transaction_id));

        let rows = order::Entity::update_many()
            .col_expr(
                order::Column::ProviderTransactionId,
                Expr::value(Some(transaction_id.to_string())),
            )
            .col_expr(
                order::Column::Notes,
                Expr::cust_with_values("notes || ?", [note]),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::ProviderTransactionId.is_null())
            .exec(&*self.db)
            .await?
            .rows_affected;

        let fresh = self.get(order_id).await?;
        if rows == 1 {
            info!(
                "Attached transaction {} to order {}",
                transaction_id, order_id
            );
            return Ok(PaymentTransition::Applied(fresh));
        }

        if fresh.provider_transaction_id.as_deref() == Some(transaction_id) {
            return Ok(PaymentTransition::AlreadyApplied(fresh));
        }
        Err(ServiceError::Conflict(format!(
            "Order {} already carries transaction {:?}",
            order_id, fresh.provider_transaction_id
        )))
    }

    /// Appends a timestamped audit line to the order without touching its
    /// status.
    pub async fn append_note(&self, order_id: Uuid, text: &str) -> Result<(), ServiceError> {
        let now = Utc::now();

        let rows = order::Entity::update_many()
            .col_expr(
                order::Column::Notes,
                Expr::cust_with_values("notes || ?", [audit_note(now, text)]),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?
            .rows_affected;

        if rows == 0 {
            return Err(ServiceError::not_found(format!("Order {} not found", order_id)));
        }
        Ok(())
    }

    /// Merchant accepts the order for fulfillment: PENDING -> PROCESSING.
    /// The tracking number is assigned here and must be non-empty.
    #[instrument(skip(self))]
    pub async fn accept(
        &self,
        order_id: Uuid,
        tracking_number: &str,
    ) -> Result<order::Model, ServiceError> {
        let tracking = tracking_number.trim();
        if tracking.is_empty() {
            return Err(ServiceError::validation("Tracking number must not be empty"));
        }

        let updated = self
            .strict_transition(
                order_id,
                OrderStatus::Processing,
                Some(&format!("accepted, tracking {}", tracking)),
                vec![(
                    order::Column::TrackingNumber,
                    Expr::value(Some(tracking.to_string())),
                )],
            )
            .await?;

        info!("Order {} accepted with tracking {}", order_id, tracking);
        Ok(updated)
    }

    /// PROCESSING -> SHIPPED.
    #[instrument(skip(self))]
    pub async fn mark_shipped(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let updated = self
            .strict_transition(order_id, OrderStatus::Shipped, None, Vec::new())
            .await?;

        self.event_sender
            .send_or_log(Event::OrderShipped(order_id))
            .await;

        info!("Order {} marked shipped", order_id);
        Ok(updated)
    }

    /// SHIPPED -> DELIVERED, stamping the delivery timestamp.
    #[instrument(skip(self))]
    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let updated = self
            .strict_transition(
                order_id,
                OrderStatus::Delivered,
                None,
                vec![(order::Column::DeliveredAt, Expr::value(Some(now)))],
            )
            .await?;

        self.event_sender
            .send_or_log(Event::OrderDelivered(order_id))
            .await;

        info!("Order {} delivered", order_id);
        Ok(updated)
    }

    /// Cancels a non-terminal order and hands its reserved stock back.
    ///
    /// The transition and the release run in one transaction; the
    /// `stock_released_at` claim keeps the release exactly-once across the
    /// cancel, sweep and delete paths.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        reason: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = get_on(&txn, order_id).await?;
        let old_status = order.status;

        let won = apply_transition(&txn, &order, OrderStatus::Canceled, reason, Vec::new()).await?;
        if !won {
            let fresh = get_on(&txn, order_id).await?;
            return Err(ServiceError::InvalidTransition {
                from: fresh.status,
                to: OrderStatus::Canceled,
            });
        }

        if claim_stock_release(&txn, order_id, Utc::now(), None).await? {
            self.release_order_stock(&txn, order_id).await?;
        }

        let updated = get_on(&txn, order_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: OrderStatus::Canceled,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderCanceled(order_id))
            .await;

        info!("Order {} canceled", order_id);
        Ok(updated)
    }

    /// Deletes an order that never reached fulfillment, releasing any stock
    /// it still holds. Orders in PROCESSING or later must go through the
    /// state machine instead.
    #[instrument(skip(self))]
    pub async fn delete(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let order = get_on(&txn, order_id).await?;
        if !matches!(
            order.status,
            OrderStatus::PendingPayment
                | OrderStatus::Pending
                | OrderStatus::PaymentFailed
                | OrderStatus::Canceled
        ) {
            return Err(ServiceError::Conflict(format!(
                "Order {} cannot be deleted in status {}",
                order_id, order.status
            )));
        }

        if claim_stock_release(&txn, order_id, Utc::now(), None).await? {
            self.release_order_stock(&txn, order_id).await?;
        }

        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        order::Entity::delete_by_id(order_id).exec(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::OrderDeleted(order_id))
            .await;

        info!("Order {} deleted", order_id);
        Ok(())
    }

    /// Sweeps stale payment state. Cancels PENDING_PAYMENT orders older than
    /// the configured window and releases stock still held by PAYMENT_FAILED
    /// orders past the retry hold. Triggered externally.
    #[instrument(skip(self))]
    pub async fn expire_stale_payments(
        &self,
        now: DateTime<Utc>,
    ) -> Result<StaleSweepSummary, ServiceError> {
        let mut summary = StaleSweepSummary::default();

        let pending_cutoff =
            now - Duration::seconds(self.config.payment_pending_timeout_secs as i64);
        let stale = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
            .filter(order::Column::CreatedAt.lt(pending_cutoff))
            .all(&*self.db)
            .await?;

        for order in stale {
            match self.cancel(order.id, Some("payment window expired")).await {
                Ok(_) => summary.canceled += 1,
                // Keep sweeping; a racing confirmation is not a failure.
                Err(e) => warn!("Skipped stale order {}: {}", order.id, e),
            }
        }

        let failed_cutoff = now - Duration::seconds(self.config.failed_stock_hold_secs as i64);
        let held = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::PaymentFailed))
            .filter(order::Column::StockReleasedAt.is_null())
            .filter(order::Column::UpdatedAt.lt(failed_cutoff))
            .all(&*self.db)
            .await?;

        for order in held {
            match self.release_failed_hold(order.id, now).await {
                Ok(true) => summary.stock_released += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to release stock for order {}: {}", order.id, e),
            }
        }

        info!(
            "Stale payment sweep: canceled {}, released stock for {}",
            summary.canceled, summary.stock_released
        );
        Ok(summary)
    }

    /// Releases the stock hold of one PAYMENT_FAILED order. Returns whether
    /// this call did the release.
    async fn release_failed_hold(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let note = audit_note(now, "reserved stock released after failed payment");
        let claimed = claim_stock_release(&txn, order_id, now, Some(note)).await?;
        if claimed {
            self.release_order_stock(&txn, order_id).await?;
        }

        txn.commit().await?;
        Ok(claimed)
    }

    /// Strict transition for merchant triggers: either this call applies the
    /// edge or the caller gets InvalidTransition against the fresh status.
    async fn strict_transition(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        detail: Option<&str>,
        extra: Vec<(order::Column, SimpleExpr)>,
    ) -> Result<order::Model, ServiceError> {
        let order = self.get(order_id).await?;
        let old_status = order.status;

        let won = apply_transition(&*self.db, &order, to, detail, extra).await?;
        if !won {
            let fresh = self.get(order_id).await?;
            return Err(ServiceError::InvalidTransition {
                from: fresh.status,
                to,
            });
        }

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: to,
            })
            .await;

        self.get(order_id).await
    }

    /// Returns every reserved unit of the order's lines to the ledger.
    async fn release_order_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let lines = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;

        for line in lines {
            self.stock
                .release_on(conn, line.item_id, line.is_bundle, line.quantity)
                .await?;
        }

        Ok(())
    }
}

async fn get_on<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("Order {}", order_id)))
}

/// Runs the conditional transition UPDATE. Returns whether this statement
/// was the one that applied it; `false` means another writer got there first
/// and the caller must reclassify against a fresh read.
async fn apply_transition<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    to: OrderStatus,
    detail: Option<&str>,
    extra: Vec<(order::Column, SimpleExpr)>,
) -> Result<bool, ServiceError> {
    if !order.status.can_transition_to(to) {
        return Err(ServiceError::InvalidTransition {
            from: order.status,
            to,
        });
    }

    let now = Utc::now();
    let note = transition_note(now, order.status, to, detail);

    let mut update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(to))
        .col_expr(
            order::Column::Notes,
            Expr::cust_with_values("notes || ?", [note]),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        );
    for (col, expr) in extra {
        update = update.col_expr(col, expr);
    }

    let rows = update
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(order.status))
        .exec(conn)
        .await?
        .rows_affected;

    Ok(rows == 1)
}

/// Marks the order's reserved stock as handed back. The IS NULL guard makes
/// the caller that sees `true` the only one allowed to run the release.
async fn claim_stock_release<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    at: DateTime<Utc>,
    note: Option<String>,
) -> Result<bool, ServiceError> {
    let mut update = order::Entity::update_many()
        .col_expr(order::Column::StockReleasedAt, Expr::value(Some(at)))
        .col_expr(order::Column::UpdatedAt, Expr::value(at));
    if let Some(line) = note {
        update = update
            .col_expr(
                order::Column::Notes,
                Expr::cust_with_values("notes || ?", [line]),
            )
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            );
    }

    let rows = update
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::StockReleasedAt.is_null())
        .exec(conn)
        .await?
        .rows_affected;

    Ok(rows == 1)
}

fn audit_note(at: DateTime<Utc>, text: &str) -> String {
    format!("{} {}\n", at.to_rfc3339_opts(SecondsFormat::Secs, true), text)
}

fn transition_note(
    at: DateTime<Utc>,
    from: OrderStatus,
    to: OrderStatus,
    detail: Option<&str>,
) -> String {
    match detail {
        Some(d) => audit_note(at, &format!("status {} -> {} ({})", from, to, d)),
        None => audit_note(at, &format!("status {} -> {}", from, to)),
    }
}

/// Order with its lines
#[derive(Debug, Serialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}
