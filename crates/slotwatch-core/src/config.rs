//! Configuration for the slot-search worker system.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! is a valid configuration. The defaults are also shipped as
//! `default_config.toml` next to this crate's manifest.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Severity;

/// Default configuration embedded in binary
pub const DEFAULT_CONFIG: &str = include_str!("../default_config.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cycle interval for tasks without their own `interval_minutes`.
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    /// Delay before re-running a cycle that could not read/write task state.
    #[serde(default = "default_persistence_retry_secs")]
    pub persistence_retry_secs: u64,
    /// K in "attempt next-best match, bounded to K attempts per cycle".
    #[serde(default = "default_max_booking_attempts")]
    pub max_booking_attempts_per_cycle: usize,
    #[serde(default = "default_true")]
    pub complete_on_booking: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            persistence_retry_secs: default_persistence_retry_secs(),
            max_booking_attempts_per_cycle: default_max_booking_attempts(),
            complete_on_booking: true,
        }
    }
}

impl SchedulerConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn persistence_retry(&self) -> Duration {
        Duration::from_secs(self.persistence_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max marketplace calls per account per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How long a cycle may wait for a permit before it is skipped.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Optional process-wide cap across all accounts.
    #[serde(default)]
    pub global_max_requests: Option<usize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            global_max_requests: None,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_supplies_path")]
    pub supplies_path: String,
    /// Upper bound of one marketplace call (one page-interaction sequence).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// How long to wait for a single element to show up.
    #[serde(default = "default_element_timeout_ms")]
    pub element_timeout_ms: u64,
    /// Retries after the first attempt, for transient failures only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            supplies_path: default_supplies_path(),
            call_timeout_secs: default_call_timeout_secs(),
            element_timeout_ms: default_element_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl MarketplaceConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn supplies_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.supplies_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Events below this severity are not sent to channels.
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_delivery_retry_ms")]
    pub retry_delay_ms: u64,
    /// `[notifications.telegram]`: registers the Telegram bot channel when present.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_telegram_timeout_secs")]
    pub timeout_secs: u64,
}

impl TelegramConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: default_min_severity(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_delay_ms: default_delivery_retry_ms(),
            telegram: None,
        }
    }
}

impl NotificationsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `SLOTWATCH_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30 * 60
}

fn default_persistence_retry_secs() -> u64 {
    30
}

fn default_max_booking_attempts() -> usize {
    3
}

fn default_max_requests() -> usize {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_base_url() -> String {
    "https://seller.wildberries.ru".to_string()
}

fn default_supplies_path() -> String {
    "/supplies-management/all-supplies".to_string()
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_element_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_min_severity() -> Severity {
    Severity::Success
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_delivery_retry_ms() -> u64 {
    1_000
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration loading
// ============================================================================

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or the embedded defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                let config = Self::from_toml_str(&contents)?;
                tracing::info!("Loaded config from {:?}", path);
                Ok(config)
            }
            None => Self::from_toml_str(DEFAULT_CONFIG),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.scheduler.default_interval_secs == 0 {
            return invalid("scheduler.default_interval_secs must be > 0");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests must be > 0");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be > 0");
        }
        if self.rate_limit.global_max_requests == Some(0) {
            return invalid("rate_limit.global_max_requests must be > 0 when set");
        }
        if self.marketplace.call_timeout_secs == 0 {
            return invalid("marketplace.call_timeout_secs must be > 0");
        }
        if self.marketplace.retry_max_delay_ms < self.marketplace.retry_base_delay_ms {
            return invalid("marketplace.retry_max_delay_ms must be >= retry_base_delay_ms");
        }
        if self.notifications.max_delivery_attempts == 0 {
            return invalid("notifications.max_delivery_attempts must be > 0");
        }
        if let Some(telegram) = &self.notifications.telegram {
            if telegram.bot_token.trim().is_empty() || telegram.chat_id.trim().is_empty() {
                return invalid("notifications.telegram needs bot_token and chat_id");
            }
            if telegram.timeout_secs == 0 {
                return invalid("notifications.telegram.timeout_secs must be > 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn embedded_defaults_match_code_defaults() {
        let config = Config::from_toml_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn empty_file_is_valid() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.default_interval(), Duration::from_secs(1800));
        assert_eq!(config.marketplace.max_retries, 3);
        assert_eq!(config.notifications.min_severity, Severity::Success);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [rate_limit]
            max_requests = 5
            global_max_requests = 100

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.global_max_requests, Some(100));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = Config::from_toml_str("[rate_limit]\nwindow_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let err = Config::from_toml_str(
            "[marketplace]\nretry_base_delay_ms = 5000\nretry_max_delay_ms = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_max_delay_ms"));
    }

    #[test]
    fn telegram_section_is_optional_and_defaulted() {
        assert_eq!(Config::default().notifications.telegram, None);

        let config = Config::from_toml_str(
            "[notifications.telegram]\nbot_token = \"123:abc\"\nchat_id = \"42\"\n",
        )
        .unwrap();
        let telegram = config.notifications.telegram.unwrap();
        assert_eq!(telegram.api_base, "https://api.telegram.org");
        assert_eq!(telegram.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn telegram_without_chat_is_rejected() {
        let err = Config::from_toml_str("[notifications.telegram]\nbot_token = \"123:abc\"\nchat_id = \" \"\n")
            .unwrap_err();
        assert!(err.to_string().contains("chat_id"));
    }

    #[test]
    fn supplies_url_joins_cleanly() {
        let mut m = MarketplaceConfig::default();
        m.base_url = "https://example.test/".into();
        assert_eq!(
            m.supplies_url(),
            "https://example.test/supplies-management/all-supplies"
        );
    }
}
