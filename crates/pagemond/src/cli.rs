//! Command line and environment configuration surface.
//!
//! Every option can be given as a flag or as a `PAGEMON_*` environment
//! variable; flags win. A TOML file named by `--config` sits underneath
//! both, and built-in defaults fill whatever is left.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use pagemon_core::{BrokerBackend, Config, ConfigError, ConfigResult, RawConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(
    name = "pagemond",
    about = "Probe a web page periodically and publish availability metrics",
    version
)]
pub struct Cli {
    /// TOML file with default values for any option below.
    #[arg(long, env = "PAGEMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Page to probe (http or https).
    #[arg(long, env = "PAGEMON_URL")]
    pub url: Option<String>,

    /// HTTP method used for probes: head or get.
    #[arg(long, env = "PAGEMON_PROBE_METHOD")]
    pub probe_method: Option<String>,

    /// Seconds between probes.
    #[arg(long, env = "PAGEMON_PING_INTERVAL")]
    pub ping_interval: Option<f64>,

    /// Seconds allowed to establish a connection.
    #[arg(long, env = "PAGEMON_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<f64>,

    /// Seconds allowed for the response to arrive.
    #[arg(long, env = "PAGEMON_READ_TIMEOUT")]
    pub read_timeout: Option<f64>,

    /// Probe attempts per cycle before giving up.
    #[arg(long, env = "PAGEMON_BACKOFF_RETRIES")]
    pub backoff_retries: Option<u32>,

    /// Seconds before the first retry; doubles on each further retry.
    #[arg(long, env = "PAGEMON_BACKOFF_BASE_DELAY")]
    pub backoff_base_delay: Option<f64>,

    /// Where events go: kafka or stdout.
    #[arg(long, env = "PAGEMON_BROKER_BACKEND")]
    pub broker_backend: Option<String>,

    /// Comma separated bootstrap servers.
    #[arg(long, env = "PAGEMON_BROKER_LIST")]
    pub broker_list: Option<String>,

    #[arg(long, env = "PAGEMON_KAFKA_TOPIC")]
    pub topic: Option<String>,

    /// Send retries inside the broker client.
    #[arg(long, env = "PAGEMON_PRODUCER_RETRIES")]
    pub producer_retries: Option<u32>,

    #[arg(long, env = "PAGEMON_SSL_KEY")]
    pub ssl_key: Option<PathBuf>,

    #[arg(long, env = "PAGEMON_SSL_CERT")]
    pub ssl_cert: Option<PathBuf>,

    #[arg(long, env = "PAGEMON_SSL_CA")]
    pub ssl_ca: Option<PathBuf>,

    /// Hand-off queue bound; 0 leaves it unbounded.
    #[arg(long, env = "PAGEMON_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Seconds shutdown waits for outstanding deliveries.
    #[arg(long, env = "PAGEMON_FLUSH_TIMEOUT")]
    pub flush_timeout: Option<f64>,

    #[arg(long, env = "PAGEMON_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Cli {
    /// The flag and environment layer.
    pub fn raw(&self) -> RawConfig {
        RawConfig {
            url: self.url.clone(),
            probe_method: self.probe_method.clone(),
            ping_interval: self.ping_interval,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            backoff_retries: self.backoff_retries,
            backoff_base_delay: self.backoff_base_delay,
            broker_backend: self.broker_backend.clone(),
            broker_list: self.broker_list.clone(),
            topic: self.topic.clone(),
            producer_retries: self.producer_retries,
            ssl_key: self.ssl_key.clone(),
            ssl_cert: self.ssl_cert.clone(),
            ssl_ca: self.ssl_ca.clone(),
            queue_capacity: self.queue_capacity,
            flush_timeout: self.flush_timeout,
        }
    }

    /// Merge all layers and validate the result.
    pub fn load(&self) -> ConfigResult<Config> {
        let file = match &self.config {
            Some(path) => RawConfig::from_file(path)?,
            None => RawConfig::default(),
        };
        let config = Config::from_raw(file.overlay(self.raw()))?;
        check_backend(config.broker.backend)?;
        Ok(config)
    }
}

fn check_backend(backend: BrokerBackend) -> ConfigResult<()> {
    if backend == BrokerBackend::Kafka && !cfg!(feature = "kafka") {
        return Err(ConfigError::BackendUnavailable(backend.to_string()));
    }
    Ok(())
}
