pub mod config;
pub mod logging;
pub mod paths;
pub mod redact;

pub use config::{
    CacheConfig, Config, ConfigError, EndpointCacheConfig, HttpConfig, LogLevel, LoggingConfig,
    ProfileConfig, ValidationError,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "cadenza";
pub const APP_AUTHOR: &str = "Cadenza";
pub const APP_QUALIFIER: &str = "io";
