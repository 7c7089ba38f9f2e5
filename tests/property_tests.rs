use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use storefront_api::config::AppConfig;
use storefront_api::entities::Currency;
use storefront_api::services::gateway::{self, PaymentGatewayService};
use uuid::Uuid;

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

fn test_config() -> AppConfig {
    AppConfig::new(
        "sqlite::memory:",
        "127.0.0.1",
        0,
        "test",
        "admin-bearer-f3a9c2e8d1b7a605-4e9c8d7b",
        "http://127.0.0.1:9",
        "merchant-042",
        "gw-shared-7c1f0a9e3b2d8c4f-a1e6b0d9",
        "cb-token-9e4d2a7c5b1f8e30-c6a2d8f1",
        "http://127.0.0.1:18080",
    )
}

proptest! {
    #[test]
    fn payment_references_round_trip(id in arb_uuid()) {
        let reference = gateway::payment_reference(id);
        prop_assert!(reference.starts_with("PAY-"));
        prop_assert!((12..=40).contains(&reference.len()));
        prop_assert_eq!(gateway::parse_reference(&reference), Some(id));
    }

    #[test]
    fn foreign_references_never_parse(junk in "[A-Za-z0-9_-]{0,48}") {
        prop_assume!(!junk.starts_with("PAY-"));
        prop_assert_eq!(gateway::parse_reference(&junk), None);
    }

    #[test]
    fn two_decimal_amounts_convert_exactly(cents in 0i64..=100_000_000_000) {
        let amount = Decimal::new(cents, 2);
        prop_assert_eq!(gateway::to_minor_units(amount).unwrap(), cents);
    }

    #[test]
    fn third_decimal_rounds_ties_away_from_zero(mils in 0i64..=100_000_000_000) {
        let amount = Decimal::new(mils, 3);
        // Integer restatement of half-away-from-zero for non-negative input.
        let expected = (mils + 5) / 10;
        prop_assert_eq!(gateway::to_minor_units(amount).unwrap(), expected);
    }

    #[test]
    fn minor_units_are_additive_over_line_totals(
        a in 0i64..=5_000_000_000,
        b in 0i64..=5_000_000_000,
    ) {
        let (first, second) = (Decimal::new(a, 2), Decimal::new(b, 2));
        prop_assert_eq!(
            gateway::to_minor_units(first + second).unwrap(),
            gateway::to_minor_units(first).unwrap() + gateway::to_minor_units(second).unwrap()
        );
    }

    #[test]
    fn request_signatures_are_deterministic_hex(amount in 1i64..=10_000_000_000) {
        let service = PaymentGatewayService::new(Arc::new(test_config())).unwrap();
        let first = service.request_signature(Currency::Usd, amount);
        let second = service.request_signature(Currency::Usd, amount);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 64);
        prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        // The currency is part of the signed payload.
        prop_assert_ne!(first, service.request_signature(Currency::Eur, amount));
    }
}
