use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Separate verbosity for the HTTP engine (`cadenza_http` target).
    #[serde(default)]
    pub engine_level: Option<LogLevel>,
    /// Mirror log lines to stderr.
    #[serde(default = "default_enabled")]
    pub console: bool,
    /// Write a daily-rotated file under the log directory.
    #[serde(default = "default_enabled")]
    pub file: bool,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            engine_level: None,
            console: default_enabled(),
            file: default_enabled(),
            max_log_files: default_max_log_files(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Settings for the shared HTTP execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// How long a single-flight entry is trusted to represent a live leader.
    #[serde(default = "default_dedup_request_timeout_ms")]
    pub dedup_request_timeout_ms: u64,
    #[serde(default = "default_dedup_sweep_interval_ms")]
    pub dedup_sweep_interval_ms: u64,
    /// Upper bound applied to any server-supplied Retry-After.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    /// Request headers that participate in the dedup key (case-insensitive).
    #[serde(default)]
    pub key_headers: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Profile overrides, keyed by profile name ("search", "download", ...).
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            dedup_request_timeout_ms: default_dedup_request_timeout_ms(),
            dedup_sweep_interval_ms: default_dedup_sweep_interval_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            key_headers: Vec::new(),
            cache: CacheConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// TTL for endpoints without an explicit entry. Zero disables caching for them.
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_secs: default_cache_ttl_secs(),
            endpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_revalidate")]
    pub revalidate: bool,
}

impl Default for EndpointCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_cache_ttl_secs(),
            revalidate: default_revalidate(),
        }
    }
}

/// Profile override as written in `config.toml`. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_budget_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrency_per_host: Option<usize>,
    #[serde(default)]
    pub max_total_concurrency_per_host: Option<i64>,
    #[serde(default)]
    pub per_request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub base_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter_ratio: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("http.dedup_request_timeout_ms must be greater than zero")]
    ZeroDedupTimeout,
    #[error("profile names must not be empty")]
    EmptyProfileName,
    #[error("cache endpoint names must not be empty")]
    EmptyEndpointName,
    #[error("profile {profile}: max_concurrency_per_host must be greater than zero")]
    ZeroConcurrency { profile: String },
    #[error("profile {profile}: jitter_ratio must be within 0.0..=1.0")]
    InvalidJitter { profile: String },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        self.http.validate()
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dedup_request_timeout_ms == 0 {
            return Err(ValidationError::ZeroDedupTimeout);
        }
        if self.cache.endpoints.keys().any(|name| name.trim().is_empty()) {
            return Err(ValidationError::EmptyEndpointName);
        }
        for (name, profile) in &self.profiles {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyProfileName);
            }
            if profile.max_concurrency_per_host == Some(0) {
                return Err(ValidationError::ZeroConcurrency {
                    profile: name.clone(),
                });
            }
            if let Some(jitter) = profile.jitter_ratio {
                if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
                    return Err(ValidationError::InvalidJitter {
                        profile: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_enabled() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("{}/{}", crate::APP_NAME, env!("CARGO_PKG_VERSION"))
}

fn default_dedup_request_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_sweep_interval_ms() -> u64 {
    5_000
}

fn default_max_cooldown_ms() -> u64 {
    5 * 60 * 1000
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_revalidate() -> bool {
    true
}
