use chrono::{Duration, FixedOffset, Offset, Utc};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_RECIPIENT_PHONE: &str = "939662630";
const DEFAULT_RECIPIENT_NAME: &str = "Leslie Lopez";
const DEFAULT_PAYMENT_MARKER: &str = "yape";
const DEFAULT_OCR_ENDPOINT: &str = "https://api.ocr.space/parse/image";
/// Lima, UTC-5, no DST.
const DEFAULT_UTC_OFFSET_MINUTES: i32 = -300;

/// What happens to an order whose proof did not pass validation. The order
/// stays Pending either way; only the audit note differs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Hard reject: the note records the failing rule and the customer must
    /// upload a new proof.
    #[default]
    Strict,
    /// Softer variant: the note flags the order for an administrator to review
    /// the proof by hand.
    ManualReview,
}

/// Payment-proof validation settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Phone number payments must be sent to
    #[serde(default = "default_recipient_phone")]
    #[validate(length(min = 9, max = 9, message = "Recipient phone must have 9 digits"))]
    pub expected_recipient_phone: String,

    /// Account holder name payments must be sent to
    #[serde(default = "default_recipient_name")]
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub expected_recipient_name: String,

    /// Brand token that must appear on a genuine receipt
    #[serde(default = "default_payment_marker")]
    #[validate(length(min = 1))]
    pub payment_marker: String,

    /// Maximum absolute difference between receipt amount and order total
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance: Decimal,

    /// Maximum age of a receipt timestamp, in hours
    #[serde(default = "default_recency_window_hours")]
    #[validate(range(min = 1, max = 720))]
    pub recency_window_hours: i64,

    /// Forward slack for payer/server clock skew, in minutes
    #[serde(default = "default_future_skew_minutes")]
    #[validate(range(min = 0, max = 120))]
    pub future_skew_minutes: i64,

    /// UTC offset of the wall-clock times printed on receipts
    #[serde(default = "default_utc_offset_minutes")]
    pub receipt_utc_offset_minutes: i32,

    /// UTC offset used to decide which day an order number belongs to
    #[serde(default = "default_utc_offset_minutes")]
    pub business_utc_offset_minutes: i32,

    #[serde(default)]
    pub rejection_policy: RejectionPolicy,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            expected_recipient_phone: default_recipient_phone(),
            expected_recipient_name: default_recipient_name(),
            payment_marker: default_payment_marker(),
            amount_tolerance: default_amount_tolerance(),
            recency_window_hours: default_recency_window_hours(),
            future_skew_minutes: default_future_skew_minutes(),
            receipt_utc_offset_minutes: default_utc_offset_minutes(),
            business_utc_offset_minutes: default_utc_offset_minutes(),
            rejection_policy: RejectionPolicy::default(),
        }
    }
}

impl PaymentConfig {
    pub fn recency_window(&self) -> Duration {
        Duration::hours(self.recency_window_hours)
    }

    pub fn future_skew(&self) -> Duration {
        Duration::minutes(self.future_skew_minutes)
    }

    pub fn receipt_offset(&self) -> FixedOffset {
        offset_from_minutes(self.receipt_utc_offset_minutes)
    }

    pub fn business_offset(&self) -> FixedOffset {
        offset_from_minutes(self.business_utc_offset_minutes)
    }
}

fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// OCR collaborator settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    /// API key; when absent the image pipeline is unavailable
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ocr_endpoint(),
            api_key: None,
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1, max = 1000000))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub ocr: OcrConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the database
    /// and environment.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            payment: PaymentConfig::default(),
            ocr: OcrConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks that span several fields or nested sections.
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        self.payment.validate()?;
        self.ocr.validate()?;

        let mut errors = ValidationErrors::new();

        if self.payment.amount_tolerance < Decimal::ZERO || self.payment.amount_tolerance > dec!(1.00)
        {
            let mut err = ValidationError::new("amount_tolerance");
            err.message = Some("Amount tolerance must be between 0 and 1.00".into());
            errors.add("amount_tolerance", err);
        }

        for (field, minutes) in [
            ("receipt_utc_offset_minutes", self.payment.receipt_utc_offset_minutes),
            ("business_utc_offset_minutes", self.payment.business_utc_offset_minutes),
        ] {
            if !(-720..=840).contains(&minutes) {
                let mut err = ValidationError::new("utc_offset");
                err.message = Some("UTC offset must be between -720 and 840 minutes".into());
                errors.add(field, err);
            }
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
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

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_recipient_phone() -> String {
    DEFAULT_RECIPIENT_PHONE.to_string()
}

fn default_recipient_name() -> String {
    DEFAULT_RECIPIENT_NAME.to_string()
}

fn default_payment_marker() -> String {
    DEFAULT_PAYMENT_MARKER.to_string()
}

fn default_amount_tolerance() -> Decimal {
    dec!(0.10)
}

fn default_recency_window_hours() -> i64 {
    24
}

fn default_future_skew_minutes() -> i64 {
    5
}

fn default_utc_offset_minutes() -> i32 {
    DEFAULT_UTC_OFFSET_MINUTES
}

fn default_ocr_endpoint() -> String {
    DEFAULT_OCR_ENDPOINT.to_string()
}

fn default_ocr_timeout_secs() -> u64 {
    30
}

/// Validates log level values
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

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("order_proof={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, nested sections with `__`)
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
        .set_default("database_url", "sqlite://order_proof.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
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
