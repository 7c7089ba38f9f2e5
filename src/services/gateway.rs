use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{order, Currency},
    errors::ServiceError,
};

type HmacSha256 = Hmac<Sha256>;

/// Prefix marking references issued by this service.
const REFERENCE_PREFIX: &str = "PAY-";

/// Provider bounds on the reference field. The natural form (prefix plus the
/// 32-hex order id) fits; the clamp covers a provider tightening its limits.
const REFERENCE_MIN_LEN: usize = 12;
const REFERENCE_MAX_LEN: usize = 40;

/// Hosted-payment-page adapter.
///
/// Pure request construction plus one outbound POST; whether a payment
/// succeeded is never decided here, only by the reconciler when the provider
/// calls back.
#[derive(Clone)]
pub struct PaymentGatewayService {
    client: reqwest::Client,
    config: Arc<AppConfig>,
}

impl PaymentGatewayService {
    pub fn new(config: Arc<AppConfig>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.gateway_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to construct HTTP client: {}", e))
            })?;

        Ok(Self { client, config })
    }

    /// Keyed integrity hash the provider verifies: HMAC-SHA256 over
    /// `merchant_id|currency|amount_minor`, hex-encoded. The amount must be
    /// the exact minor-unit value placed in the request body.
    pub fn request_signature(&self, currency: Currency, amount_minor: i64) -> String {
        let payload = format!(
            "{}|{}|{}",
            self.config.gateway_merchant_id, currency, amount_minor
        );
        let mut mac = HmacSha256::new_from_slice(self.config.gateway_shared_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constructs the full initiation request without sending it.
    pub fn build_initiation(
        &self,
        order: &order::Model,
    ) -> Result<PaymentInitiation, ServiceError> {
        let amount_minor = to_minor_units(order.total)?;
        let signature = self.request_signature(order.currency, amount_minor);

        Ok(PaymentInitiation {
            endpoint: format!(
                "{}/payments",
                self.config.gateway_base_url.trim_end_matches('/')
            ),
            body: InitiationRequest {
                merchant_id: self.config.gateway_merchant_id.clone(),
                amount: amount_minor,
                currency: order.currency,
                reference: order.payment_reference.clone(),
                callback_url: self.config.callback_url(),
                return_url: self.config.return_url(),
                signature,
            },
        })
    }

    /// POSTs the initiation request and returns the hosted payment URL.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn initiate(&self, order: &order::Model) -> Result<PaymentHandoff, ServiceError> {
        let initiation = self.build_initiation(order)?;

        let response = self
            .client
            .post(&initiation.endpoint)
            .json(&initiation.body)
            .send()
            .await
            .map_err(|e| {
                warn!("Payment initiation failed for order {}: {}", order.id, e);
                ServiceError::ExternalService(format!("Payment provider unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(
                "Payment provider rejected initiation for order {}: {}",
                order.id, status
            );
            return Err(ServiceError::ExternalService(format!(
                "Payment provider returned {}",
                status
            )));
        }

        let handoff: PaymentHandoff = response.json().await.map_err(|e| {
            ServiceError::ExternalService(format!("Malformed provider response: {}", e))
        })?;

        info!("Payment initiated for order {}", order.id);
        Ok(handoff)
    }
}

/// Derives the provider-facing reference from the order id: prefix plus the
/// 32-hex simple form, clamped to the provider's length bounds. Reproducible
/// from the id alone, and stored on the order row so a clamped form still
/// resolves by indexed equality.
pub fn payment_reference(order_id: Uuid) -> String {
    clamp_reference(format!("{}{}", REFERENCE_PREFIX, order_id.simple()))
}

/// Inverse of [`payment_reference`] for unclamped references.
pub fn parse_reference(reference: &str) -> Option<Uuid> {
    let hex = reference.strip_prefix(REFERENCE_PREFIX)?;
    Uuid::try_parse(hex).ok()
}

fn clamp_reference(mut raw: String) -> String {
    while raw.len() < REFERENCE_MIN_LEN {
        raw.push('0');
    }
    if raw.len() > REFERENCE_MAX_LEN {
        raw.truncate(REFERENCE_MAX_LEN);
    }
    raw
}

/// Rounds to the provider's minor-unit granularity (two decimal places,
/// midpoints away from zero) and scales to an integer count of minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    (rounded * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::validation("Amount exceeds the supported range"))
}

/// Fully constructed initiation request, exposed for inspection.
#[derive(Debug, Serialize)]
pub struct PaymentInitiation {
    pub endpoint: String,
    pub body: InitiationRequest,
}

#[derive(Debug, Serialize)]
pub struct InitiationRequest {
    pub merchant_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub reference: String,
    pub callback_url: String,
    pub return_url: String,
    pub signature: String,
}

/// Provider response: where to send the shopper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentHandoff {
    pub payment_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig::new(
            "sqlite::memory:",
            "127.0.0.1",
            8080,
            "test",
            "admin-bearer-f3a9c2e8d1b7a605-4e9c8d7b",
            "https://gateway.example.test",
            "merchant-42",
            "gw-shared-7c1f0a9e3b2d8c4f-a1e6b0d9",
            "cb-token-9e4d2a7c5b1f8e30-c6a2d8f1",
            "https://shop.example.test",
        ))
    }

    #[test]
    fn reference_round_trips_through_parse() {
        let id = Uuid::new_v4();
        let reference = payment_reference(id);
        assert!(reference.starts_with(REFERENCE_PREFIX));
        assert!(reference.len() >= REFERENCE_MIN_LEN && reference.len() <= REFERENCE_MAX_LEN);
        assert_eq!(parse_reference(&reference), Some(id));
    }

    #[test]
    fn parse_rejects_foreign_references() {
        assert_eq!(parse_reference("INV-0011223344"), None);
        assert_eq!(parse_reference("PAY-not-a-uuid"), None);
        assert_eq!(parse_reference(""), None);
    }

    #[test]
    fn clamp_pads_short_and_truncates_long() {
        assert_eq!(clamp_reference("PAY-1".to_string()), "PAY-10000000");
        let long = format!("PAY-{}", "a".repeat(60));
        assert_eq!(clamp_reference(long).len(), REFERENCE_MAX_LEN);
    }

    #[test]
    fn minor_units_round_midpoints_away_from_zero() {
        assert_eq!(to_minor_units(dec!(10)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(10.004)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(10.005)).unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(0.125)).unwrap(), 13);
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let gateway = PaymentGatewayService::new(test_config()).unwrap();

        let a = gateway.request_signature(Currency::Usd, 1999);
        let b = gateway.request_signature(Currency::Usd, 1999);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, gateway.request_signature(Currency::Usd, 2000));
        assert_ne!(a, gateway.request_signature(Currency::Eur, 1999));
    }

    #[test]
    fn initiation_body_signs_the_same_amount_it_carries() {
        let gateway = PaymentGatewayService::new(test_config()).unwrap();
        let order_id = Uuid::new_v4();
        let order = order::Model {
            id: order_id,
            order_number: "ORD-TEST".to_string(),
            customer_id: Uuid::new_v4(),
            status: crate::entities::OrderStatus::PendingPayment,
            payment_method: crate::entities::PaymentMethod::Gateway,
            currency: Currency::Eur,
            subtotal: dec!(19.99),
            shipping: dec!(5.00),
            discount: dec!(0),
            total: dec!(24.985),
            shipping_address: "1 Test Lane".to_string(),
            payment_reference: payment_reference(order_id),
            provider_transaction_id: None,
            tracking_number: None,
            delivered_at: None,
            stock_released_at: None,
            notes: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            version: 1,
        };

        let initiation = gateway.build_initiation(&order).unwrap();
        // 24.985 rounds away from zero to 24.99.
        assert_eq!(initiation.body.amount, 2499);
        assert_eq!(
            initiation.body.signature,
            gateway.request_signature(Currency::Eur, 2499)
        );
        assert_eq!(initiation.body.reference, order.payment_reference);
        assert!(initiation.body.return_url.contains("token="));
        assert!(initiation.endpoint.ends_with("/payments"));
    }
}
