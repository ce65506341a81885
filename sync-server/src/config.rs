//! Configuration loading for opsync-server.
//!
//! Configuration is loaded from a TOML file (default: `opsync.toml`).
//! Every field has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for opsync-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Rate limiting and validation limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Per-account storage quota.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// A device counts as online if seen within this window (default: 300).
    #[serde(default = "default_online_window_secs")]
    pub online_window_secs: u64,
    /// How long upload replies are replayable by request id (default: 300).
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Largest accepted request body in bytes (default: 64 MB).
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum serialized payload size per operation (default: 20MB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Rate limiting and validation limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Upload requests per account per minute (default: 100).
    #[serde(default = "default_uploads_per_minute")]
    pub uploads_per_minute: u32,
    /// Download requests per account per minute (default: 300).
    #[serde(default = "default_downloads_per_minute")]
    pub downloads_per_minute: u32,
    /// Requests per second across all accounts (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Operations per upload request (default: 1000).
    #[serde(default = "default_max_ops_per_upload")]
    pub max_ops_per_upload: usize,
    /// How far into the future a client timestamp may be (default: 60s).
    #[serde(default = "default_max_clock_drift_ms")]
    pub max_clock_drift_ms: i64,
    /// Entries allowed in an operation's vector clock (default: 100).
    #[serde(default = "default_max_vector_clock_entries")]
    pub max_vector_clock_entries: usize,
}

/// Per-account storage quota.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Quota assigned to new accounts (default: 100MB).
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Tombstones expire this many days after the delete (default: 90).
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u64,
    /// Devices unseen for this many days are forgotten (default: 50).
    #[serde(default = "default_stale_device_days")]
    pub stale_device_days: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_online_window_secs() -> u64 {
    300
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_database_path() -> PathBuf {
    PathBuf::from("opsync.db")
}

fn default_max_payload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_uploads_per_minute() -> u32 {
    100
}

fn default_downloads_per_minute() -> u32 {
    300
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_max_ops_per_upload() -> usize {
    1000
}

fn default_max_clock_drift_ms() -> i64 {
    60_000
}

fn default_max_vector_clock_entries() -> usize {
    100
}

fn default_quota_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_tombstone_retention_days() -> u64 {
    90
}

fn default_stale_device_days() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            online_window_secs: default_online_window_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            uploads_per_minute: default_uploads_per_minute(),
            downloads_per_minute: default_downloads_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            max_ops_per_upload: default_max_ops_per_upload(),
            max_clock_drift_ms: default_max_clock_drift_ms(),
            max_vector_clock_entries: default_max_vector_clock_entries(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_bytes: default_quota_bytes(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
            tombstone_retention_days: default_tombstone_retention_days(),
            stale_device_days: default_stale_device_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CleanupConfig {
    /// Tombstone lifetime in milliseconds.
    pub fn tombstone_retention_ms(&self) -> i64 {
        days_to_ms(self.tombstone_retention_days)
    }

    /// Device staleness threshold in milliseconds.
    pub fn stale_device_ms(&self) -> i64 {
        days_to_ms(self.stale_device_days)
    }
}

fn days_to_ms(days: u64) -> i64 {
    i64::try_from(days.saturating_mul(24 * 60 * 60 * 1000)).unwrap_or(i64::MAX)
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed values fail [`Config::validate`].
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a limit by accident.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.limits.uploads_per_minute == 0 {
            return Err(invalid("limits.uploads_per_minute", "must be > 0"));
        }
        if self.limits.downloads_per_minute == 0 {
            return Err(invalid("limits.downloads_per_minute", "must be > 0"));
        }
        if self.limits.global_requests_per_second == 0 {
            return Err(invalid("limits.global_requests_per_second", "must be > 0"));
        }
        if self.limits.max_ops_per_upload == 0 {
            return Err(invalid("limits.max_ops_per_upload", "must be > 0"));
        }
        if self.limits.max_clock_drift_ms < 0 {
            return Err(invalid("limits.max_clock_drift_ms", "must not be negative"));
        }
        if self.server.max_request_bytes == 0 {
            return Err(invalid("server.max_request_bytes", "must be > 0"));
        }
        if self.storage.max_payload_bytes == 0 {
            return Err(invalid("storage.max_payload_bytes", "must be > 0"));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(invalid("cleanup.interval_secs", "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
