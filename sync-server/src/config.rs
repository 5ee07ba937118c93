//! Configuration loading for rootsync-server.
//!
//! Configuration is loaded from a TOML file (default: `rootsync.toml`).

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for rootsync-server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Rate limiting and timeout configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Background rescan configuration.
    #[serde(default)]
    pub rescan: RescanConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Password every client must present in REGISTERCLIENT.
    #[serde(default = "default_password")]
    pub password: String,
    /// Secret key path for the iroh endpoint (generated on first start if missing).
    pub secret_key_path: Option<PathBuf>,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database holding the key-value namespace.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Directory under which every root directory gets its file areas.
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    /// Maximum file size accepted in a push (default: 64MB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

/// Rate limiting and timeout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connection attempts per remote endpoint per minute (default: 10).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Maximum transactions per client per minute (default: 600).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Maximum transactions per second across all clients (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Maximum concurrent connections (default: 10000).
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Seconds a new connection has to complete REGISTERCLIENT (default: 10).
    #[serde(default = "default_register_timeout_secs")]
    pub register_timeout_secs: u64,
    /// Seconds any single read on a transaction stream may wait (default: 30).
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
    /// Seconds a server push may take before it is abandoned (default: 30).
    #[serde(default = "default_fanout_timeout_secs")]
    pub fanout_timeout_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 127.0.0.1:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Enable the administrative endpoints (default: true).
    #[serde(default = "default_true")]
    pub admin_enabled: bool,
}

/// Background rescan configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RescanConfig {
    /// Rescan interval in seconds (default: 600).
    #[serde(default = "default_rescan_interval")]
    pub interval_secs: u64,
    /// Enable the rescan task (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_password() -> String {
    "rootsync".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("rootsync.db")
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("rootsync-files")
}

fn default_max_file_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_connections_per_minute() -> u32 {
    10
}

fn default_messages_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_max_concurrent_sessions() -> usize {
    10_000
}

fn default_register_timeout_secs() -> u64 {
    10
}

fn default_transaction_timeout_secs() -> u64 {
    30
}

fn default_fanout_timeout_secs() -> u64 {
    30
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rescan_interval() -> u64 {
    600 // 10 minutes
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: default_password(),
            secret_key_path: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            files_dir: default_files_dir(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            register_timeout_secs: default_register_timeout_secs(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            fanout_timeout_secs: default_fanout_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: true,
            admin_enabled: true,
        }
    }
}

impl Default for RescanConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rescan_interval(),
            enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
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

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.password.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.password",
                reason: "must not be empty".to_string(),
            });
        }
        let rates = [
            ("limits.connections_per_minute", self.limits.connections_per_minute),
            ("limits.messages_per_minute", self.limits.messages_per_minute),
            (
                "limits.global_requests_per_second",
                self.limits.global_requests_per_second,
            ),
        ];
        for (field, value) in rates {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.rescan.enabled && self.rescan.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rescan.interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Largest frame the transaction codec accepts: one file plus envelope overhead.
    pub fn max_frame_size(&self) -> usize {
        self.storage.max_file_size.saturating_mul(2).saturating_add(64 * 1024)
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
        /// Dotted name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
