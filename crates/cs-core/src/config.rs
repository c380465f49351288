use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::ReservationStatus;

/// Top-level configuration loaded from `~/.channel-sync/config.toml`.
///
/// **Security**: this struct never stores API keys, secrets, or webhook
/// signing keys. It stores the *names* of the environment variables that
/// hold them; [`CredentialProvider`] resolves those at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$CHANNEL_SYNC_CONFIG` or `~/.channel-sync/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CHANNEL_SYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.reconcile.validate()?;
        self.mapping.validate()?;
        if self.webhook.workers == 0 {
            return Err(ConfigError::Validation(
                "webhook.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Expand a leading `~/` in the store path.
    pub fn resolved_store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".channel-sync")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

/// Largest page the channel API will serve.
pub const MAX_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: default_channel_base_url(),
            api_key_env: default_api_key_env(),
            api_secret_env: default_api_secret_env(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Validation(format!(
                "channel.page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::Validation(
                "channel.max_pages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_channel_base_url() -> String {
    "https://api.stays.net/external/v1".into()
}
fn default_api_key_env() -> String {
    "CHANNEL_API_KEY".into()
}
fn default_api_secret_env() -> String {
    "CHANNEL_API_SECRET".into()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_max_pages() -> u32 {
    100
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Minimum gap between two outbound calls.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_min_delay_ms() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    10_000
}

/// Which reservation date the sync window filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateType {
    Arrival,
    Departure,
    Creation,
}

impl DateType {
    pub fn as_str(self) -> &'static str {
        match self {
            DateType::Arrival => "arrival",
            DateType::Departure => "departure",
            DateType::Creation => "creation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_window_back")]
    pub window_days_back: i64,
    #[serde(default = "default_window_forward")]
    pub window_days_forward: i64,
    #[serde(default = "default_date_type")]
    pub date_type: DateType,
    /// Cap on the per-run error list.
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    /// Calls observed before the breaker may trip.
    #[serde(default = "default_breaker_min_calls")]
    pub breaker_min_calls: u32,
    #[serde(default = "default_breaker_failure_ratio")]
    pub breaker_failure_ratio: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            window_days_back: default_window_back(),
            window_days_forward: default_window_forward(),
            date_type: default_date_type(),
            max_errors: default_max_errors(),
            breaker_min_calls: default_breaker_min_calls(),
            breaker_failure_ratio: default_breaker_failure_ratio(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.breaker_failure_ratio > 0.0 && self.breaker_failure_ratio <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "reconcile.breaker_failure_ratio must be in (0, 1], got {}",
                self.breaker_failure_ratio
            )));
        }
        if self.window_days_back < 0 || self.window_days_forward < 0 {
            return Err(ConfigError::Validation(
                "reconcile window bounds must not be negative".into(),
            ));
        }
        if self.window_days_back + self.window_days_forward == 0 {
            return Err(ConfigError::Validation(
                "reconcile window must span at least one day".into(),
            ));
        }
        Ok(())
    }
}

fn default_reconcile_interval() -> u64 {
    3600
}
fn default_window_back() -> i64 {
    30
}
fn default_window_forward() -> i64 {
    365
}
fn default_date_type() -> DateType {
    DateType::Arrival
}
fn default_max_errors() -> usize {
    50
}
fn default_breaker_min_calls() -> u32 {
    20
}
fn default_breaker_failure_ratio() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub verify_signature: bool,
    #[serde(default = "default_webhook_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_webhook_workers")]
    pub workers: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_signature: false,
            secret_env: default_webhook_secret_env(),
            queue_capacity: default_queue_capacity(),
            workers: default_webhook_workers(),
        }
    }
}

fn default_webhook_secret_env() -> String {
    "CHANNEL_WEBHOOK_SECRET".into()
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_webhook_workers() -> usize {
    2
}

/// Operator-declared status mappings on top of the built-in table.
///
/// ```toml
/// [mapping.extra_status]
/// inquiry = "pending"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub extra_status: BTreeMap<String, String>,
}

impl MappingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (remote, canonical) in &self.extra_status {
            if remote.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "mapping.extra_status has an empty remote value".into(),
                ));
            }
            if ReservationStatus::from_canonical(canonical).is_none() {
                return Err(ConfigError::Validation(format!(
                    "mapping.extra_status.{remote} = '{canonical}' is not a canonical status"
                )));
            }
        }
        Ok(())
    }

    /// Parsed overrides, lower-cased on the remote side.
    pub fn overrides(&self) -> Vec<(String, ReservationStatus)> {
        self.extra_status
            .iter()
            .filter_map(|(remote, canonical)| {
                ReservationStatus::from_canonical(canonical)
                    .map(|s| (remote.trim().to_lowercase(), s))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.channel-sync/sync.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_api_key_env")]
    pub api_key_env: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            api_key_env: default_daemon_api_key_env(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    9310
}
fn default_daemon_api_key_env() -> String {
    "CHANNEL_SYNC_API_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
///
/// Config stores env var *names*; this provider resolves them on demand.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.is_empty())
    }

    /// Basic-auth pair for the channel API.
    pub fn channel_credentials(channel: &ChannelConfig) -> Option<(String, String)> {
        Some((
            Self::from_env(&channel.api_key_env)?,
            Self::from_env(&channel.api_secret_env)?,
        ))
    }

    pub fn webhook_secret(webhook: &WebhookConfig) -> Option<String> {
        Self::from_env(&webhook.secret_env)
    }

    /// `None` means the HTTP API runs unauthenticated (development mode).
    pub fn daemon_api_key(daemon: &DaemonConfig) -> Option<String> {
        Self::from_env(&daemon.api_key_env)
    }
}
