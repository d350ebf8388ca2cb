use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::{env, path::Path, time::Duration};
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::middleware_helpers::retry::RetryConfig;

const CONFIG_DIR: &str = "config";
const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Checkout window and idempotency lifetimes.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct CheckoutConfig {
    #[validate(range(min = 60))]
    pub session_ttl_secs: u64,
    /// One-off extension granted when a pay-now method is chosen.
    pub pay_now_extension_secs: u64,
    /// Sessions this close to expiry can no longer be mutated or confirmed.
    pub expiry_buffer_secs: u64,
    /// How far reservations outlive the session deadline.
    pub reservation_grace_secs: u64,
    #[validate(range(min = 1))]
    pub idempotency_ttl_hours: u64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 15 * 60,
            pay_now_extension_secs: 10 * 60,
            expiry_buffer_secs: 40,
            reservation_grace_secs: 5 * 60,
            idempotency_ttl_hours: 24,
        }
    }
}

impl CheckoutConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn pay_now_extension(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pay_now_extension_secs as i64)
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_buffer_secs as i64)
    }

    pub fn reservation_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_grace_secs as i64)
    }

    pub fn idempotency_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.idempotency_ttl_hours as i64)
    }
}

/// Amounts are minor currency units.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct PricingConfig {
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,
    #[validate(range(min = 0))]
    pub shipping_fee: i64,
    #[validate(range(min = 0))]
    pub cod_fee: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.02),
            shipping_fee: 50,
            cod_fee: 50,
            currency: "INR".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct OutboxConfig {
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1))]
    pub lease_secs: u64,
    #[validate(range(min = 1))]
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 1_000,
            lease_secs: 60,
            max_attempts: 6,
            backoff_base_secs: 5,
            backoff_cap_secs: 3_600,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct SettlerConfig {
    #[validate(range(min = 1))]
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,
    /// A PROCESSING intent untouched for this long is reclaimable.
    #[validate(range(min = 1))]
    pub lease_secs: u64,
}

impl Default for SettlerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 60,
            backoff_cap_secs: 3_600,
            poll_interval_ms: 2_000,
            batch_size: 20,
            lease_secs: 300,
        }
    }
}

/// Transport-level retry for transient infrastructure failures.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[validate(custom = "validate_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: 2.0,
            jitter: settings.jitter,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct PaymentConfig {
    pub provider: String,
    pub gateway_base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: "razorpay".to_string(),
            gateway_base_url: "https://api.razorpay.com".to_string(),
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct PublisherConfig {
    #[validate(custom = "validate_publisher_backend")]
    pub backend: String,
    pub redis_url: String,
    /// Prefix applied to channel names on the broker.
    pub channel_prefix: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            backend: "in-memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection string (`postgres://` or `sqlite://`)
    #[validate(length(min = 1))]
    pub database_url: String,

    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    /// Run pending migrations on start-up
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Start background workers alongside the HTTP server
    #[serde(default = "default_true_bool")]
    pub run_workers: bool,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,
    #[serde(default)]
    #[validate]
    pub pricing: PricingConfig,
    #[serde(default)]
    #[validate]
    pub outbox: OutboxConfig,
    #[serde(default)]
    #[validate]
    pub settler: SettlerConfig,
    #[serde(default)]
    #[validate]
    pub retry: RetrySettings,
    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,
    #[serde(default)]
    #[validate]
    pub publisher: PublisherConfig,
}

impl AppConfig {
    /// Builds a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            run_workers: true,
            checkout: CheckoutConfig::default(),
            pricing: PricingConfig::default(),
            outbox: OutboxConfig::default(),
            settler: SettlerConfig::default(),
            retry: RetrySettings::default(),
            payment: PaymentConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    /// Checks that only make sense across fields or per environment.
    fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();
        if self.is_production() && self.payment.webhook_secret.trim().is_empty() {
            let mut err = ValidationError::new("webhook_secret");
            err.message = Some("payment.webhook_secret is required in production".into());
            errors.add("payment", err);
        }
        if self.outbox.backoff_cap_secs < self.outbox.backoff_base_secs {
            let mut err = ValidationError::new("backoff_cap_secs");
            err.message = Some("outbox.backoff_cap_secs must be >= backoff_base_secs".into());
            errors.add("outbox", err);
        }
        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }
        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_max_connections() -> u32 {
    20
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_idle_timeout_secs() -> u64 {
    300
}
fn default_db_acquire_timeout_secs() -> u64 {
    5
}

fn default_true_bool() -> bool {
    true
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

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

fn validate_jitter(jitter: f64) -> Result<(), ValidationError> {
    if !jitter.is_finite() || !(0.0..1.0).contains(&jitter) {
        let mut err = ValidationError::new("jitter");
        err.message = Some("jitter must be in [0, 1)".into());
        return Err(err);
    }
    Ok(())
}

fn validate_publisher_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("publisher_backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("order_pipeline={level},tower_http=info,sqlx=warn");
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `config/default.*`
/// 3. `config/{RUN_ENV}.*`
/// 4. Environment variables (`APP__*`, nested with `__`)
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

    let config = Config::builder()
        .set_default("database_url", "sqlite://order_pipeline.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;
    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "development".into(),
        )
    }

    #[test]
    fn defaults_validate() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.pricing.tax_rate, dec!(0.02));
        assert_eq!(cfg.checkout.expiry_buffer(), chrono::Duration::seconds(40));
    }

    #[test]
    fn production_requires_webhook_secret() {
        let mut cfg = base_config();
        cfg.environment = "production".into();
        assert!(cfg.validate_additional_constraints().is_err());
        cfg.payment.webhook_secret = "whsec_live".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn rejects_unknown_publisher_backend() {
        let mut cfg = base_config();
        cfg.publisher.backend = "kafka".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_tax_rate() {
        let mut cfg = base_config();
        cfg.pricing.tax_rate = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jitter_must_stay_below_one() {
        let mut cfg = base_config();
        cfg.retry.jitter = 0.5;
        assert!(cfg.validate().is_ok());
        cfg.retry.jitter = 1.0;
        assert!(cfg.validate().is_err());
        cfg.retry.jitter = f64::NAN;
        assert!(cfg.validate().is_err());
    }
}
