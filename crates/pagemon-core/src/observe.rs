//! Structured pipeline events and the observer hook.
//!
//! The pipeline reports what happens through [`Observer::on_event`] and has
//! no opinion on formatting or destination. [`TracingObserver`] is the
//! default subscriber and forwards every event to `tracing`.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backoff::BackoffAttempt;
use crate::event::MonitoringEvent;

/// Process-level lifecycle.
///
/// `Starting → Running → ShuttingDown → Stopped`; no state is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        })
    }
}

/// Steps of the shutdown sequence, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    StopProber,
    CancelTasks,
    CloseNetworkClient,
    FlushBroker,
    ReleaseScheduler,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StopProber => "stop_prober",
            Self::CancelTasks => "cancel_tasks",
            Self::CloseNetworkClient => "close_network_client",
            Self::FlushBroker => "flush_broker",
            Self::ReleaseScheduler => "release_scheduler",
        })
    }
}

/// Everything the pipeline reports.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A probe completed and produced an event.
    ProbeSucceeded(MonitoringEvent),
    /// A probe failed transiently and will be retried.
    Backoff(BackoffAttempt),
    /// Retries are exhausted or the failure was permanent.
    ProbeFailed { url: String, error: String },
    /// An event entered the hand-off queue; `sequence` counts from 1.
    Enqueued { sequence: u64 },
    /// An event was handed to the broker client.
    Submitted { topic: String, key: String },
    Delivered {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// The broker did not accept a message. It is not retried.
    DeliveryFailed { key: String, error: String },
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    ShutdownPhase(ShutdownPhase),
    /// Outstanding work cancelled during shutdown.
    TasksCancelled { count: usize },
    /// Events still queued at shutdown, dropped without publishing.
    QueueDiscarded { count: usize },
    /// Deliveries without an outcome when the flush timeout ran out.
    FlushTimedOut {
        outstanding: usize,
        timeout: Duration,
    },
}

/// Receives pipeline events.
///
/// Called inline from the pipeline tasks: implementations must not block.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Forwards pipeline events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ProbeSucceeded(ev) => {
                info!(
                    source = "monitor",
                    ts = %ev.timestamp.format(crate::event::TIMESTAMP_FORMAT),
                    page_url = %ev.url,
                    http_code = ev.http_status,
                    response_time = ev.response_time_micros(),
                    "probe succeeded"
                );
            }
            PipelineEvent::Backoff(a) => {
                warn!(
                    target_op = %a.target,
                    args = %a.args,
                    tries = a.attempt,
                    elapsed = a.elapsed.as_secs_f64(),
                    wait = a.wait.as_secs_f64(),
                    error = %a.error,
                    "backoff"
                );
            }
            PipelineEvent::ProbeFailed { url, error } => {
                error!(page_url = %url, %error, "probe failed permanently");
            }
            PipelineEvent::Enqueued { sequence } => {
                debug!(sequence, "event enqueued");
            }
            PipelineEvent::Submitted { topic, key } => {
                debug!(%topic, %key, "record submitted");
            }
            PipelineEvent::Delivered {
                topic,
                partition,
                offset,
            } => {
                info!(%topic, partition, offset, "record produced");
            }
            PipelineEvent::DeliveryFailed { key, error } => {
                warn!(%key, %error, "failed to deliver message");
            }
            PipelineEvent::StateChanged { from, to } => {
                info!(%from, %to, "lifecycle state changed");
            }
            PipelineEvent::ShutdownPhase(phase) => {
                info!(%phase, "shutdown phase");
            }
            PipelineEvent::TasksCancelled { count } => {
                info!(count, "cancelled outstanding tasks");
            }
            PipelineEvent::QueueDiscarded { count } => {
                if *count > 0 {
                    warn!(count, "discarded queued events on shutdown");
                }
            }
            PipelineEvent::FlushTimedOut {
                outstanding,
                timeout,
            } => {
                warn!(
                    outstanding,
                    timeout = timeout.as_secs_f64(),
                    "flush timed out with deliveries outstanding"
                );
            }
        }
    }
}
