use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{
    config::AppConfig,
    entities::{order, OrderStatus},
    errors::ServiceError,
    services::{
        gateway,
        orders::{OrderService, PaymentTransition},
    },
};

/// How the provider notification reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackChannel {
    /// Server-to-server POST; transaction id and status are mandatory.
    Webhook,
    /// Shopper's browser returning via the registered return URL; every
    /// parameter past the token is optional, including all of them.
    Redirect,
}

/// Provider notification normalized across channels.
#[derive(Debug, Clone)]
pub struct CallbackNotification {
    pub channel: CallbackChannel,
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    pub reference: Option<String>,
}

/// What reconciling a notification did to the matched order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This notification transitioned the order.
    Applied,
    /// Replay or back-fill; the order had already absorbed this payment.
    AlreadyProcessed,
    /// Acknowledged without mutation (late success after a recorded
    /// failure, or any notification against a canceled order).
    Ignored,
}

impl ReconcileOutcome {
    /// Acknowledgement label returned to the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "ok",
            ReconcileOutcome::AlreadyProcessed => "already_processed",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderStatus {
    Success,
    Failure,
}

/// Turns out-of-band provider notifications into order transitions.
///
/// Everything here is deliberately single-pass: resolve the order, classify
/// the notification against its current state, apply at most one conditional
/// transition. The provider retries on failure, so nothing blocks or loops.
#[derive(Clone)]
pub struct ReconciliationService {
    orders: Arc<OrderService>,
    config: Arc<AppConfig>,
}

impl ReconciliationService {
    pub fn new(orders: Arc<OrderService>, config: Arc<AppConfig>) -> Self {
        Self { orders, config }
    }

    /// Constant-time check of the shared callback token. Nothing is read or
    /// written on behalf of a notification before this passes.
    pub fn verify_token(&self, presented: Option<&str>) -> Result<(), ServiceError> {
        let presented = presented
            .ok_or_else(|| ServiceError::Unauthorized("Missing callback token".to_string()))?;
        if !constant_time_eq(presented, &self.config.gateway_callback_token) {
            return Err(ServiceError::Unauthorized(
                "Invalid callback token".to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn process(
        &self,
        notification: CallbackNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let transaction_id = normalized(&notification.transaction_id);
        let reference = normalized(&notification.reference);
        let raw_status = normalized(&notification.status);

        if notification.channel == CallbackChannel::Webhook {
            if transaction_id.is_none() {
                warn!("Webhook callback without a transaction id");
                return Err(ServiceError::validation(
                    "Callback is missing transaction_id",
                ));
            }
            if raw_status.is_none() {
                warn!("Webhook callback without a status");
                return Err(ServiceError::validation("Callback is missing status"));
            }
        }

        let status = match raw_status {
            Some(raw) => parse_status(raw)?,
            // Providers only send the shopper back down the return URL once
            // the payment settled, so a bare redirect reads as success.
            None => ProviderStatus::Success,
        };

        let (order, best_effort_match) = self
            .resolve(notification.channel, transaction_id, reference)
            .await?;

        match status {
            ProviderStatus::Success => {
                self.apply_success(order, transaction_id, best_effort_match)
                    .await
            }
            ProviderStatus::Failure => self.apply_failure(order, transaction_id).await,
        }
    }

    /// Lookup precedence: reference (by parsed order id, then by the indexed
    /// column, which also covers clamped forms), then transaction id. Only a
    /// redirect carrying no identifiers at all falls back to the most recent
    /// gateway order still awaiting payment.
    async fn resolve(
        &self,
        channel: CallbackChannel,
        transaction_id: Option<&str>,
        reference: Option<&str>,
    ) -> Result<(order::Model, bool), ServiceError> {
        if let Some(reference) = reference {
            if let Some(order_id) = gateway::parse_reference(reference) {
                if let Some(order) = self.orders.find(order_id).await? {
                    return Ok((order, false));
                }
            }
            if let Some(order) = self.orders.find_by_payment_reference(reference).await? {
                return Ok((order, false));
            }
        }

        if let Some(txid) = transaction_id {
            if let Some(order) = self.orders.find_by_transaction_id(txid).await? {
                return Ok((order, false));
            }
        }

        if channel == CallbackChannel::Redirect
            && transaction_id.is_none()
            && reference.is_none()
        {
            if let Some(order) = self.orders.latest_pending_gateway_order().await? {
                warn!(
                    "Parameterless redirect matched to most recent pending gateway order {}",
                    order.id
                );
                return Ok((order, true));
            }
        }

        warn!(
            "Callback could not be resolved to an order (transaction_id={:?}, reference={:?})",
            transaction_id, reference
        );
        Err(ServiceError::not_found("No order matches the callback"))
    }

    async fn apply_success(
        &self,
        order: order::Model,
        transaction_id: Option<&str>,
        best_effort_match: bool,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if matches!(
            order.status,
            OrderStatus::PaymentFailed | OrderStatus::Canceled
        ) {
            warn!(
                "Ignoring late success callback for order {} in status {}",
                order.id, order.status
            );
            return Ok(ReconcileOutcome::Ignored);
        }

        match self.orders.confirm_payment(order.id, transaction_id).await {
            Ok(PaymentTransition::Applied(applied)) => {
                if best_effort_match {
                    if let Err(e) = self
                        .orders
                        .append_note(
                            applied.id,
                            "confirmed via parameterless redirect, matched as most recent pending gateway order",
                        )
                        .await
                    {
                        warn!("Failed to note best-effort match on order {}: {}", applied.id, e);
                    }
                }
                info!("Callback confirmed payment for order {}", applied.id);
                Ok(ReconcileOutcome::Applied)
            }
            Ok(PaymentTransition::AlreadyApplied(_)) => Ok(ReconcileOutcome::AlreadyProcessed),
            // The order failed or was canceled between resolution and the
            // conditional update; same classification as above.
            Err(ServiceError::InvalidTransition { from, .. })
                if matches!(from, OrderStatus::PaymentFailed | OrderStatus::Canceled) =>
            {
                warn!(
                    "Ignoring late success callback for order {} in status {}",
                    order.id, from
                );
                Ok(ReconcileOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_failure(
        &self,
        order: order::Model,
        transaction_id: Option<&str>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if order.status != OrderStatus::PendingPayment
            && order.status != OrderStatus::PaymentFailed
        {
            warn!(
                "Ignoring failure callback for order {} in status {}",
                order.id, order.status
            );
            return Ok(ReconcileOutcome::Ignored);
        }

        match self.orders.fail_payment(order.id, transaction_id).await {
            Ok(PaymentTransition::Applied(_)) => Ok(ReconcileOutcome::Applied),
            Ok(PaymentTransition::AlreadyApplied(_)) => Ok(ReconcileOutcome::AlreadyProcessed),
            Err(ServiceError::InvalidTransition { from, .. }) => {
                warn!(
                    "Ignoring failure callback for order {} in status {}",
                    order.id, from
                );
                Ok(ReconcileOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }
}

fn normalized(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_status(raw: &str) -> Result<ProviderStatus, ServiceError> {
    match raw.to_ascii_lowercase().as_str() {
        "settled" => Ok(ProviderStatus::Success),
        "failed" => Ok(ProviderStatus::Failure),
        other => {
            warn!("Unrecognized provider status '{}'", other);
            Err(ServiceError::validation(format!(
                "Unrecognized provider status '{}'",
                other
            )))
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
