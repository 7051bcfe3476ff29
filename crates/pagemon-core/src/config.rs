//! Typed daemon configuration.
//!
//! [`RawConfig`] is the loosely-typed layer every source produces (TOML file,
//! environment, command line). Layers are merged with [`RawConfig::overlay`]
//! and validated once into an immutable [`Config`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, ConfigResult};
use crate::queue::MAX_QUEUE_CAPACITY;

pub const DEFAULT_PING_INTERVAL_SECS: f64 = 5.0;
/// Slightly above a multiple of the 3s TCP retransmission window.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 4.0;
pub const DEFAULT_READ_TIMEOUT_SECS: f64 = 3.0;
pub const DEFAULT_BACKOFF_RETRIES: u32 = 10;
pub const DEFAULT_BACKOFF_BASE_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_BROKER_LIST: &str = "localhost:9092";
pub const DEFAULT_TOPIC: &str = "pagemonitor_metrics";
pub const DEFAULT_PRODUCER_RETRIES: u32 = 3;
pub const DEFAULT_FLUSH_TIMEOUT_SECS: f64 = 10.0;

const MAX_TOPIC_LEN: usize = 249;

/// HTTP method used for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMethod {
    #[default]
    Head,
    Get,
}

impl ProbeMethod {
    pub fn as_http(self) -> http::Method {
        match self {
            Self::Head => http::Method::HEAD,
            Self::Get => http::Method::GET,
        }
    }
}

impl std::str::FromStr for ProbeMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" => Ok(Self::Head),
            "get" => Ok(Self::Get),
            other => Err(ConfigError::UnknownVariant {
                option: "probe method",
                value: other.to_string(),
                expected: "head, get",
            }),
        }
    }
}

/// Which broker client the publisher talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerBackend {
    #[default]
    Kafka,
    /// JSON lines on stdout, for running without a broker.
    Stdout,
}

impl std::str::FromStr for BrokerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "stdout" => Ok(Self::Stdout),
            other => Err(ConfigError::UnknownVariant {
                option: "broker backend",
                value: other.to_string(),
                expected: "kafka, stdout",
            }),
        }
    }
}

impl fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kafka => f.write_str("kafka"),
            Self::Stdout => f.write_str("stdout"),
        }
    }
}

/// Optional TLS credentials for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsMaterial {
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub bootstrap_servers: Vec<String>,
    pub topic: String,
    /// How many times the client retries sending a failing message.
    pub producer_retries: u32,
    pub tls: Option<TlsMaterial>,
}

impl BrokerConfig {
    /// Comma separated list in the form broker clients expect.
    pub fn bootstrap_list(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

/// Validated, immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The probed endpoint as configured.
    pub url: String,
    /// Parsed form of `url`.
    pub target: Uri,
    pub probe_method: ProbeMethod,
    /// Pause between the end of one probe cycle and the next.
    pub ping_interval: Duration,
    /// Bound on DNS, TCP and TLS setup.
    pub connect_timeout: Duration,
    /// Bound on the response head and draining the body.
    pub read_timeout: Duration,
    /// Retry schedule within one probe cycle.
    pub backoff: BackoffPolicy,
    pub broker: BrokerConfig,
    /// `None` means the hand-off queue is unbounded.
    pub queue_capacity: Option<usize>,
    /// Upper bound on waiting for outstanding deliveries at shutdown.
    pub flush_timeout: Duration,
}

/// Unvalidated configuration layer.
///
/// Field names double as the keys of the TOML config file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub url: Option<String>,
    pub probe_method: Option<String>,
    pub ping_interval: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub read_timeout: Option<f64>,
    pub backoff_retries: Option<u32>,
    pub backoff_base_delay: Option<f64>,
    pub broker_backend: Option<String>,
    pub broker_list: Option<String>,
    pub topic: Option<String>,
    pub producer_retries: Option<u32>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_ca: Option<PathBuf>,
    /// 0 selects an unbounded queue.
    pub queue_capacity: Option<usize>,
    pub flush_timeout: Option<f64>,
}

macro_rules! overlay_fields {
    ($base:ident, $top:ident; $($field:ident),+ $(,)?) => {
        RawConfig {
            $($field: $top.$field.or($base.$field),)+
        }
    };
}

impl RawConfig {
    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge `top` over `self`; values set in `top` win.
    pub fn overlay(self, top: RawConfig) -> RawConfig {
        let base = self;
        overlay_fields!(base, top;
            url, probe_method, ping_interval, connect_timeout, read_timeout,
            backoff_retries, backoff_base_delay, broker_backend, broker_list,
            topic, producer_retries, ssl_key, ssl_cert, ssl_ca, queue_capacity,
            flush_timeout,
        )
    }
}

impl Config {
    /// Validate a merged configuration layer, filling in defaults.
    pub fn from_raw(raw: RawConfig) -> ConfigResult<Self> {
        let url = raw.url.ok_or(ConfigError::Missing("url"))?;
        let target = parse_target(&url)?;

        let probe_method = raw
            .probe_method
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();

        let ping_interval = seconds(
            "ping interval",
            raw.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL_SECS),
        )?;
        let connect_timeout = seconds(
            "connect timeout",
            raw.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )?;
        let read_timeout = seconds(
            "read timeout",
            raw.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
        )?;

        let max_attempts = raw.backoff_retries.unwrap_or(DEFAULT_BACKOFF_RETRIES);
        if max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                option: "backoff retries",
                min: 1,
                value: 0,
            });
        }
        let base_delay = seconds(
            "backoff base delay",
            raw.backoff_base_delay.unwrap_or(DEFAULT_BACKOFF_BASE_DELAY_SECS),
        )?;

        let queue_capacity = raw.queue_capacity.filter(|&cap| cap > 0);
        if let Some(cap) = queue_capacity.filter(|&cap| cap > MAX_QUEUE_CAPACITY) {
            return Err(ConfigError::TooLarge {
                option: "queue capacity",
                max: MAX_QUEUE_CAPACITY as u64,
                value: cap as u64,
            });
        }

        let broker = BrokerConfig {
            backend: raw
                .broker_backend
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            bootstrap_servers: parse_broker_list(
                raw.broker_list.as_deref().unwrap_or(DEFAULT_BROKER_LIST),
            )?,
            topic: validate_topic(raw.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()))?,
            producer_retries: raw.producer_retries.unwrap_or(DEFAULT_PRODUCER_RETRIES),
            tls: validate_tls(raw.ssl_key, raw.ssl_cert, raw.ssl_ca)?,
        };

        Ok(Self {
            url,
            target,
            probe_method,
            ping_interval,
            connect_timeout,
            read_timeout,
            backoff: BackoffPolicy::exponential(base_delay, max_attempts),
            broker,
            queue_capacity,
            flush_timeout: seconds(
                "flush timeout",
                raw.flush_timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT_SECS),
            )?,
        })
    }

    /// Configuration for `url` with every other option at its default.
    pub fn for_url(url: impl Into<String>) -> ConfigResult<Self> {
        Self::from_raw(RawConfig {
            url: Some(url.into()),
            ..RawConfig::default()
        })
    }
}

fn parse_target(url: &str) -> ConfigResult<Uri> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(_) => return Err(invalid("scheme must be http or https")),
        None => return Err(invalid("missing scheme")),
    }
    match uri.host() {
        Some(host) if !host.is_empty() => Ok(uri),
        _ => Err(invalid("missing host")),
    }
}

fn seconds(option: &'static str, value: f64) -> ConfigResult<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidDuration { option, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { option, value })
}

fn parse_broker_list(list: &str) -> ConfigResult<Vec<String>> {
    let brokers: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if brokers.is_empty() {
        return Err(ConfigError::EmptyBrokerList);
    }
    Ok(brokers)
}

fn validate_topic(topic: String) -> ConfigResult<String> {
    let legal = !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic != "."
        && topic != ".."
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if legal {
        Ok(topic)
    } else {
        Err(ConfigError::InvalidTopic(topic))
    }
}

fn validate_tls(
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    ca: Option<PathBuf>,
) -> ConfigResult<Option<TlsMaterial>> {
    if key.is_some() != cert.is_some() {
        return Err(ConfigError::IncompleteTls);
    }
    for (option, path) in [("ssl key", &key), ("ssl cert", &cert), ("ssl ca", &ca)] {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::TlsFileMissing {
                    option,
                    path: path.clone(),
                });
            }
        }
    }
    if key.is_none() && ca.is_none() {
        return Ok(None);
    }
    Ok(Some(TlsMaterial { key, cert, ca }))
}
