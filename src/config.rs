use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::entities::Currency;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Application configuration, layered from defaults, `config/*.toml`, and
/// `APP__`-prefixed environment variables.
///
/// Gateway credentials and the callback token are explicit fields here and
/// get injected into the services that need them; nothing reads ambient
/// process state after startup.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(length(min = 1, message = "database_url must not be empty"))]
    pub database_url: String,

    /// Run embedded migrations on startup.
    #[serde(default = "default_true")]
    pub auto_migrate: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1, message = "port must be non-zero"))]
    pub port: u16,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Origins allowed to call the storefront endpoints; empty means no
    /// CORS layer is installed.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,

    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Static bearer token guarding merchant endpoints.
    #[validate(custom = "validate_shared_token")]
    pub admin_token: String,

    /// Base URL of the payment provider's initiation endpoint.
    #[validate(url(message = "gateway_base_url must be a valid URL"))]
    pub gateway_base_url: String,

    #[validate(length(min = 1, message = "gateway_merchant_id must not be empty"))]
    pub gateway_merchant_id: String,

    /// Shared secret keying the request integrity hash.
    #[validate(custom = "validate_shared_token")]
    pub gateway_shared_secret: String,

    /// Token the provider presents on callbacks (bearer header for webhooks,
    /// query parameter baked into the registered return URL).
    #[validate(custom = "validate_shared_token")]
    pub gateway_callback_token: String,

    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1))]
    pub gateway_timeout_secs: u64,

    /// Public base URL of this service, used to build the callback and
    /// return URLs handed to the provider.
    #[validate(url(message = "public_base_url must be a valid URL"))]
    pub public_base_url: String,

    /// Flat shipping fees in minor units (cents) per supported currency.
    #[serde(default = "default_shipping_fee_minor")]
    #[validate(range(min = 0))]
    pub shipping_fee_usd_minor: i64,

    #[serde(default = "default_shipping_fee_minor")]
    #[validate(range(min = 0))]
    pub shipping_fee_eur_minor: i64,

    /// How long an order may sit in PENDING_PAYMENT before the stale sweep
    /// cancels it and releases its stock.
    #[serde(default = "default_payment_pending_timeout_secs")]
    #[validate(range(min = 60))]
    pub payment_pending_timeout_secs: u64,

    /// How long a PAYMENT_FAILED order keeps its reservation for a retry
    /// before the sweep releases the stock.
    #[serde(default = "default_failed_stock_hold_secs")]
    #[validate(range(min = 60))]
    pub failed_stock_hold_secs: u64,
}

impl AppConfig {
    /// Construct a configuration programmatically (tests, tooling); secrets
    /// still have to satisfy [`AppConfig::validate`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        database_url: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        environment: impl Into<String>,
        admin_token: impl Into<String>,
        gateway_base_url: impl Into<String>,
        gateway_merchant_id: impl Into<String>,
        gateway_shared_secret: impl Into<String>,
        gateway_callback_token: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            auto_migrate: default_true(),
            host: host.into(),
            port,
            environment: environment.into(),
            log_level: default_log_level(),
            log_json: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            cors_allowed_origins: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            admin_token: admin_token.into(),
            gateway_base_url: gateway_base_url.into(),
            gateway_merchant_id: gateway_merchant_id.into(),
            gateway_shared_secret: gateway_shared_secret.into(),
            gateway_callback_token: gateway_callback_token.into(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            public_base_url: public_base_url.into(),
            shipping_fee_usd_minor: default_shipping_fee_minor(),
            shipping_fee_eur_minor: default_shipping_fee_minor(),
            payment_pending_timeout_secs: default_payment_pending_timeout_secs(),
            failed_stock_hold_secs: default_failed_stock_hold_secs(),
        }
    }

    pub fn shipping_fee(&self, currency: Currency) -> Decimal {
        let minor = match currency {
            Currency::Usd => self.shipping_fee_usd_minor,
            Currency::Eur => self.shipping_fee_eur_minor,
        };
        Decimal::new(minor, 2)
    }

    pub fn callback_url(&self) -> String {
        format!(
            "{}/api/v1/payments/callback",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Return URL registered with the provider. The callback token rides
    /// along as a query parameter so even an empty-parameter browser
    /// redirect arrives authenticated.
    pub fn return_url(&self) -> String {
        format!(
            "{}/api/v1/payments/return?token={}",
            self.public_base_url.trim_end_matches('/'),
            self.gateway_callback_token
        )
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_gateway_timeout_secs() -> u64 {
    10
}
fn default_shipping_fee_minor() -> i64 {
    500
}
fn default_payment_pending_timeout_secs() -> u64 {
    1800
}
fn default_failed_stock_hold_secs() -> u64 {
    3600
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Shared-secret hygiene for the admin token, gateway secret, and callback
/// token: long enough, not a placeholder, not a repeated character run.
fn validate_shared_token(token: &str) -> Result<(), ValidationError> {
    let trimmed = token.trim();

    if trimmed.len() < 32 {
        let mut err = ValidationError::new("shared_token");
        err.message = Some("Shared tokens must be at least 32 characters".into());
        return Err(err);
    }

    let lower = trimmed.to_ascii_lowercase();
    let weak_fragments = ["changeme", "password", "default", "secret", "12345"];
    if weak_fragments.iter().any(|pattern| lower.contains(pattern)) {
        let mut err = ValidationError::new("shared_token");
        err.message =
            Some("Shared token appears to be weak; use a cryptographically random string".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("shared_token");
            err.message = Some("Shared token cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // Secrets (admin token, gateway credentials) have no defaults on purpose;
    // they must come from a config file or the environment.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    for required in [
        "admin_token",
        "gateway_merchant_id",
        "gateway_shared_secret",
        "gateway_callback_token",
        "gateway_base_url",
        "public_base_url",
    ] {
        if config.get_string(required).is_err() {
            error!(
                "{} is not configured. Set APP__{} or add it to config/{}.toml",
                required,
                required.to_uppercase(),
                run_env
            );
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{required} is required but not configured"
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:",
            "127.0.0.1",
            8080,
            "test",
            "admin-bearer-f3a9c2e8d1b7a605-4e9c8d7b",
            "https://pay.example.test",
            "merchant-042",
            "gw-shared-7c1f0a9e3b2d8c4f-a1e6b0d9",
            "cb-token-9e4d2a7c5b1f8e30-c6a2d8f1",
            "https://shop.example.test",
        )
    }

    #[test]
    fn well_formed_config_validates() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn short_tokens_are_rejected() {
        let mut cfg = test_config();
        cfg.admin_token = "short".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn weak_tokens_are_rejected() {
        let mut cfg = test_config();
        cfg.gateway_shared_secret = "password-password-password-password".to_string();
        assert!(cfg.validate().is_err());

        cfg = test_config();
        cfg.gateway_callback_token = "a".repeat(40);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shipping_fee_uses_minor_units() {
        let cfg = test_config();
        assert_eq!(cfg.shipping_fee(Currency::Usd).to_string(), "5.00");
    }

    #[test]
    fn return_url_carries_callback_token() {
        let cfg = test_config();
        let url = cfg.return_url();
        assert!(url.starts_with("https://shop.example.test/api/v1/payments/return?token="));
        assert!(url.contains(&cfg.gateway_callback_token));
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let mut cfg = test_config();
        cfg.log_level = "verbose".to_string();
        assert!(cfg.validate().is_err());
    }
}
