//! Lifecycle coordinator.
//!
//! Runs the prober and the publisher as two tasks sharing the hand-off
//! queue, waits for a termination signal or for either task to stop, then
//! walks the shutdown sequence to completion:
//!
//! 1. stop the prober
//! 2. cancel outstanding work and drop events still queued
//! 3. close the probe connection
//! 4. flush the broker, bounded by the flush timeout
//! 5. release the scheduler
//!
//! The process state only moves forward through
//! `Starting → Running → ShuttingDown → Stopped`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use pagemon_core::{
    Config, LifecycleState, Observer, PipelineEvent, QueueReceiver, ShutdownPhase, event_queue,
};
use pagemon_probe::{Probe, Prober, ProberError};
use pagemon_publish::{Broker, BrokerError, FlushReport, Publisher};

use crate::exit;

/// Why the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal, by name.
    Signal(String),
    /// The probe failed permanently or ran out of retries.
    ProbeExhausted(String),
    /// The broker client can no longer publish.
    BrokerUnavailable(String),
    /// A pipeline task panicked or stopped on its own.
    TaskFailed(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Signal(_) => exit::OK,
            Self::ProbeExhausted(_) | Self::BrokerUnavailable(_) => exit::UNAVAILABLE,
            Self::TaskFailed(_) => exit::SOFTWARE,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Signal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::ProbeExhausted(e) => write!(f, "probe failed: {e}"),
            Self::BrokerUnavailable(e) => write!(f, "broker unavailable: {e}"),
            Self::TaskFailed(e) => write!(f, "pipeline task failed: {e}"),
        }
    }
}

/// What a finished run reports.
#[derive(Debug)]
pub struct Outcome {
    pub reason: ShutdownReason,
    /// Events left in the queue at shutdown and dropped.
    pub discarded: usize,
    /// Publisher delivery counters after the final flush. `None` if the
    /// publisher task was lost.
    pub flush: Option<FlushReport>,
    /// Every state the process went through, in order.
    pub states: Vec<LifecycleState>,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        self.reason.exit_code()
    }
}

type ProberJoin = Result<Result<u64, ProberError>, JoinError>;
type PublisherJoin<B> = Result<(Publisher<B>, QueueReceiver, Result<(), BrokerError>), JoinError>;

pub struct Coordinator<P, B> {
    config: Arc<Config>,
    probe: Arc<P>,
    broker: Arc<B>,
    observer: Arc<dyn Observer>,
    state: LifecycleState,
    states: Vec<LifecycleState>,
}

impl<P, B> Coordinator<P, B>
where
    P: Probe + 'static,
    B: Broker,
{
    /// Clients are built by the caller; the coordinator starts in
    /// [`LifecycleState::Starting`].
    pub fn new(
        config: Arc<Config>,
        probe: Arc<P>,
        broker: Arc<B>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            config,
            probe,
            broker,
            observer,
            state: LifecycleState::Starting,
            states: vec![LifecycleState::Starting],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run the pipeline until `shutdown` resolves with a signal name or a
    /// task stops, then shut down. Always ends in [`LifecycleState::Stopped`].
    pub async fn run<S>(mut self, shutdown: S) -> Outcome
    where
        S: Future<Output = String>,
    {
        let (queue_tx, queue_rx) = event_queue(self.config.queue_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let prober = Prober::new(
            self.probe.clone(),
            queue_tx,
            self.config.backoff,
            self.config.ping_interval,
            self.observer.clone(),
        );
        let mut publisher = Publisher::new(
            self.broker.clone(),
            self.config.broker.topic.clone(),
            self.observer.clone(),
        );

        self.transition(LifecycleState::Running);
        info!(
            url = %self.config.url,
            broker = self.broker.name(),
            topic = %self.config.broker.topic,
            "pipeline running"
        );

        let mut prober_task = tokio::spawn(prober.run(stop_rx.clone()));
        let mut publisher_task: JoinHandle<_> = tokio::spawn(async move {
            let mut queue = queue_rx;
            let result = publisher.run(&mut queue, stop_rx).await;
            (publisher, queue, result)
        });

        let mut prober_joined: Option<ProberJoin> = None;
        let mut publisher_joined: Option<PublisherJoin<B>> = None;

        tokio::pin!(shutdown);
        let reason = tokio::select! {
            biased;
            name = &mut shutdown => ShutdownReason::Signal(name),
            joined = &mut prober_task => {
                let reason = prober_stopped(&joined);
                prober_joined = Some(joined);
                reason
            }
            joined = &mut publisher_task => {
                let reason = publisher_stopped(&joined);
                publisher_joined = Some(joined);
                reason
            }
        };

        if reason.is_clean() {
            info!(reason = %reason, "shutting down");
        } else {
            error!(reason = %reason, "shutting down");
        }
        self.transition(LifecycleState::ShuttingDown);

        // 1. No new probe cycles.
        self.phase(ShutdownPhase::StopProber);
        let _ = stop_tx.send(true);
        let mut cancelled = 0;
        let prober_joined = match prober_joined {
            Some(joined) => joined,
            None => {
                cancelled += 1;
                prober_task.await
            }
        };
        match prober_joined {
            Ok(Ok(produced)) => debug!(produced, "prober stopped"),
            Ok(Err(e)) => debug!(error = %e, "prober stopped with error"),
            Err(e) => debug!(error = %e, "prober task lost"),
        }

        // 2. The publisher stops consuming; whatever is still queued goes.
        self.phase(ShutdownPhase::CancelTasks);
        let publisher_joined = match publisher_joined {
            Some(joined) => joined,
            None => {
                cancelled += 1;
                publisher_task.await
            }
        };
        let (mut publisher, discarded) = match publisher_joined {
            Ok((publisher, queue, result)) => {
                if let Err(e) = result {
                    warn!(error = %e, "publisher stopped with error");
                }
                (Some(publisher), queue.discard_remaining())
            }
            Err(e) => {
                error!(error = %e, "publisher task lost");
                (None, 0)
            }
        };
        self.observer
            .on_event(&PipelineEvent::QueueDiscarded { count: discarded });
        self.observer
            .on_event(&PipelineEvent::TasksCancelled { count: cancelled });

        // 3.
        self.phase(ShutdownPhase::CloseNetworkClient);
        self.probe.close().await;

        // 4. Settle every delivery already handed to the broker.
        self.phase(ShutdownPhase::FlushBroker);
        let timeout = self.config.flush_timeout;
        let flush = match publisher.as_mut() {
            Some(publisher) => Some(publisher.flush(timeout).await),
            None => {
                match tokio::time::timeout(timeout, self.broker.flush(timeout)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "broker flush failed"),
                    Err(_) => warn!(?timeout, "broker flush timed out"),
                }
                None
            }
        };
        if let Some(report) = &flush {
            info!(
                submitted = report.stats.submitted,
                delivered = report.stats.delivered,
                failed = report.stats.failed,
                unencodable = report.stats.unencodable,
                abandoned = report.stats.abandoned,
                completed = report.completed,
                "broker flushed"
            );
        }

        // 5.
        self.phase(ShutdownPhase::ReleaseScheduler);
        self.transition(LifecycleState::Stopped);

        Outcome {
            reason,
            discarded,
            flush,
            states: self.states,
        }
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        debug_assert!(to > from, "lifecycle moved backwards: {from} -> {to}");
        self.state = to;
        self.states.push(to);
        self.observer
            .on_event(&PipelineEvent::StateChanged { from, to });
    }

    fn phase(&self, phase: ShutdownPhase) {
        self.observer.on_event(&PipelineEvent::ShutdownPhase(phase));
    }
}

fn prober_stopped(joined: &ProberJoin) -> ShutdownReason {
    match joined {
        Ok(Err(e @ ProberError::ProbeFailed { .. })) => ShutdownReason::ProbeExhausted(e.to_string()),
        Ok(Err(e @ ProberError::QueueClosed)) => ShutdownReason::TaskFailed(e.to_string()),
        Ok(Ok(_)) => ShutdownReason::TaskFailed("prober stopped unexpectedly".to_string()),
        Err(e) => ShutdownReason::TaskFailed(format!("prober: {e}")),
    }
}

fn publisher_stopped<B>(joined: &PublisherJoin<B>) -> ShutdownReason {
    match joined {
        Ok((_, _, Err(e))) => ShutdownReason::BrokerUnavailable(e.to_string()),
        Ok((_, _, Ok(()))) => ShutdownReason::TaskFailed("publisher stopped unexpectedly".to_string()),
        Err(e) => ShutdownReason::TaskFailed(format!("publisher: {e}")),
    }
}
