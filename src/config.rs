use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Observed platform commission: 5% of gross, expressed in basis points so
/// all fee math stays in integer minor units.
const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;
const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_OTP_WINDOW_SECS: u64 = 600;
const DEFAULT_IDEMPOTENCY_RETENTION_SECS: u64 = 24 * 3600;
const DEFAULT_EVENT_DEDUP_RETENTION_SECS: u64 = 24 * 3600;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Application configuration. Loaded from `config/default.toml` (optional),
/// an environment-specific file, and `APP__`-prefixed environment variables,
/// later sources overriding earlier ones.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Structured JSON log output (production); pretty text otherwise.
    #[serde(default)]
    pub log_json: bool,

    /// Platform commission in basis points of gross volume.
    #[validate(range(max = 10_000))]
    #[serde(default = "default_platform_fee_bps")]
    pub platform_fee_bps: u32,

    /// Wrong-code attempts allowed per dispatch before delivery confirmation
    /// is rate-limited.
    #[validate(range(min = 1))]
    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: u32,

    #[serde(default = "default_otp_window_secs")]
    pub otp_window_secs: u64,

    /// How long stored idempotency results are replayed before expiring.
    #[serde(default = "default_idempotency_retention_secs")]
    pub idempotency_retention_secs: u64,

    /// How long inbound event ids are remembered for webhook deduplication.
    #[serde(default = "default_event_dedup_retention_secs")]
    pub event_dedup_retention_secs: u64,

    /// Courier provider backend: "static" (deterministic, in-process) or
    /// "http".
    #[serde(default = "default_provider_backend")]
    pub provider_backend: String,

    /// Base URL for the HTTP provider backend.
    #[serde(default)]
    pub provider_base_url: Option<String>,

    /// Bounded timeout for every courier-provider call.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Shared secret for inbound webhook HMAC verification. Unset disables
    /// verification (development only).
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// TTL for cached aggregate views (settlement snapshots, dashboard
    /// counts); invalidation by the reconciliation bridge takes precedence.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Comma-separated allowed CORS origins; unset falls back to permissive
    /// CORS in development only.
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_platform_fee_bps() -> u32 {
    DEFAULT_PLATFORM_FEE_BPS
}
fn default_otp_max_attempts() -> u32 {
    DEFAULT_OTP_MAX_ATTEMPTS
}
fn default_otp_window_secs() -> u64 {
    DEFAULT_OTP_WINDOW_SECS
}
fn default_idempotency_retention_secs() -> u64 {
    DEFAULT_IDEMPOTENCY_RETENTION_SECS
}
fn default_event_dedup_retention_secs() -> u64 {
    DEFAULT_EVENT_DEDUP_RETENTION_SECS
}
fn default_provider_backend() -> String {
    "static".to_string()
}
fn default_provider_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            platform_fee_bps: default_platform_fee_bps(),
            otp_max_attempts: default_otp_max_attempts(),
            otp_window_secs: default_otp_window_secs(),
            idempotency_retention_secs: default_idempotency_retention_secs(),
            event_dedup_retention_secs: default_event_dedup_retention_secs(),
            provider_backend: default_provider_backend(),
            provider_base_url: None,
            provider_timeout_secs: default_provider_timeout_secs(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            cors_allowed_origins: None,
        }
    }
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}

/// Loads configuration: `config/default.toml`, then
/// `config/{APP_ENV}.toml`, then `APP__*` environment variables.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let env_name = std::env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let cfg = Config::builder()
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{env_name}")).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config
        .validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

    info!(
        environment = %app_config.environment,
        provider = %app_config.provider_backend,
        "configuration loaded"
    );
    Ok(app_config)
}

/// Initializes the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.platform_fee_bps, 500);
        assert_eq!(cfg.otp_max_attempts, 5);
        assert_eq!(cfg.idempotency_retention_secs, 86_400);
        assert!(cfg.is_development());
        assert!(cfg.validate().is_ok());
    }
}
