//! Error types for configuration loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while building a [`crate::Config`].
///
/// Every variant is fatal at startup: the daemon exits before scheduling
/// any task.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{option} must be a finite number of seconds greater than zero, got {value}")]
    InvalidDuration { option: &'static str, value: f64 },

    #[error("{option} must be at least {min}, got {value}")]
    OutOfRange {
        option: &'static str,
        min: u64,
        value: u64,
    },

    #[error("{option} must be at most {max}, got {value}")]
    TooLarge {
        option: &'static str,
        max: u64,
        value: u64,
    },

    #[error("unknown {option} {value:?} (expected one of: {expected})")]
    UnknownVariant {
        option: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("broker list is empty")]
    EmptyBrokerList,

    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),

    #[error("tls key and certificate must be configured together")]
    IncompleteTls,

    #[error("tls file {path:?} for {option} does not exist")]
    TlsFileMissing { option: &'static str, path: PathBuf },

    #[error("broker backend {0:?} is not compiled into this binary")]
    BackendUnavailable(String),

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
