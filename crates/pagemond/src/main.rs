//! pagemond — the page monitor daemon.
//!
//! # Usage
//!
//! ```text
//! pagemond --url https://example.test/health --broker-list kafka-1:9092
//! PAGEMON_URL=https://example.test PAGEMON_BROKER_BACKEND=stdout pagemond
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pagemon_core::{BrokerBackend, Config, ConfigError, TracingObserver};
use pagemon_probe::HttpProber;
use pagemon_publish::{Broker, BrokerError, StdoutBroker};
use pagemond::{Cli, Coordinator, LogFormat, ShutdownSignals, exit};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(exit::CONFIG);
        }
    };

    init_tracing(cli.log_format);

    let config = match cli.load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(exit::CONFIG);
        }
    };

    info!(
        bin = env!("CARGO_BIN_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        config = ?config,
        "pagemond starting"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build the runtime");
            return ExitCode::from(exit::SOFTWARE);
        }
    };

    let code = match runtime.block_on(serve(config)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            if e.downcast_ref::<BrokerError>().is_some() {
                exit::UNAVAILABLE
            } else if e.downcast_ref::<ConfigError>().is_some() {
                exit::CONFIG
            } else {
                exit::SOFTWARE
            }
        }
    };

    runtime.shutdown_timeout(Duration::from_secs(1));
    info!(exit_code = code, "shutdown successfully");
    ExitCode::from(code)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Text => builder.init(),
    }
}

async fn serve(config: Arc<Config>) -> anyhow::Result<u8> {
    let probe = Arc::new(HttpProber::new(&config).context("building the probe client")?);
    let signals = ShutdownSignals::install().context("installing signal handlers")?;

    match config.broker.backend {
        BrokerBackend::Stdout => {
            Ok(run(config, probe, Arc::new(StdoutBroker::stdout()), signals).await)
        }
        BrokerBackend::Kafka => serve_kafka(config, probe, signals).await,
    }
}

#[cfg(feature = "kafka")]
async fn serve_kafka(
    config: Arc<Config>,
    probe: Arc<HttpProber>,
    signals: ShutdownSignals,
) -> anyhow::Result<u8> {
    let broker = pagemon_publish::KafkaBroker::connect(&config.broker, config.connect_timeout)
        .await
        .context("connecting to kafka")?;
    Ok(run(config, probe, Arc::new(broker), signals).await)
}

#[cfg(not(feature = "kafka"))]
async fn serve_kafka(
    config: Arc<Config>,
    _probe: Arc<HttpProber>,
    _signals: ShutdownSignals,
) -> anyhow::Result<u8> {
    Err(ConfigError::BackendUnavailable(config.broker.backend.to_string()).into())
}

async fn run<B: Broker>(
    config: Arc<Config>,
    probe: Arc<HttpProber>,
    broker: Arc<B>,
    mut signals: ShutdownSignals,
) -> u8 {
    let coordinator = Coordinator::new(config, probe, broker, Arc::new(TracingObserver));
    let outcome = coordinator
        .run(async move { signals.recv().await.to_string() })
        .await;

    info!(
        reason = %outcome.reason,
        discarded = outcome.discarded,
        "pipeline stopped"
    );
    outcome.exit_code()
}
