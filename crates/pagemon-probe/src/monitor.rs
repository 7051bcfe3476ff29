//! The prober loop.
//!
//! Each cycle runs one probe under the retry policy, turns the outcome into
//! a [`MonitoringEvent`], hands it to the queue and sleeps for the ping
//! interval. Exhausted retries end the loop with an error; the caller decides
//! what happens to the rest of the process.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use pagemon_core::{
    BackoffAttempt, BackoffPolicy, MonitoringEvent, Observer, PipelineEvent, QueueSender, Retry,
};

use crate::checker::{Probe, ProbeError};

/// Fatal prober failures.
#[derive(Debug, Error)]
pub enum ProberError {
    #[error("probe of {url} failed: {source}")]
    ProbeFailed {
        url: String,
        #[source]
        source: ProbeError,
    },

    #[error("event queue closed while the prober was running")]
    QueueClosed,
}

/// Periodic prober feeding the hand-off queue.
pub struct Prober<P> {
    probe: Arc<P>,
    queue: QueueSender,
    backoff: BackoffPolicy,
    ping_interval: Duration,
    observer: Arc<dyn Observer>,
}

impl<P: Probe> Prober<P> {
    pub fn new(
        probe: Arc<P>,
        queue: QueueSender,
        backoff: BackoffPolicy,
        ping_interval: Duration,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            probe,
            queue,
            backoff,
            ping_interval,
            observer,
        }
    }

    /// Run probe cycles until `shutdown` turns `true`.
    ///
    /// Shutdown is honoured between cycles, during backoff waits, while
    /// waiting for queue capacity and during the ping interval. A probe
    /// request already in flight runs to completion.
    ///
    /// Returns the number of events enqueued.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<u64, ProberError> {
        let probe = &*self.probe;
        let observer = &*self.observer;
        let url = probe.url().to_string();
        let retry = Retry::new(self.backoff, "probe").with_args(url.clone());
        let mut produced = 0u64;

        debug!(%url, interval = ?self.ping_interval, "prober starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = retry
                .run_until_cancelled(
                    move || probe.probe(),
                    |attempt: &BackoffAttempt| {
                        observer.on_event(&PipelineEvent::Backoff(attempt.clone()))
                    },
                    &mut shutdown,
                )
                .await;

            let outcome = match result {
                None => break,
                Some(Ok(outcome)) => outcome,
                Some(Err(source)) => {
                    observer.on_event(&PipelineEvent::ProbeFailed {
                        url: url.clone(),
                        error: source.to_string(),
                    });
                    return Err(ProberError::ProbeFailed { url, source });
                }
            };

            let event = MonitoringEvent::now(url.as_str(), outcome.status, outcome.elapsed);
            observer.on_event(&PipelineEvent::ProbeSucceeded(event.clone()));

            let pushed = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                pushed = self.queue.push(event) => pushed,
            };
            if pushed.is_err() {
                if *shutdown.borrow() {
                    break;
                }
                return Err(ProberError::QueueClosed);
            }
            produced += 1;
            observer.on_event(&PipelineEvent::Enqueued { sequence: produced });

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep(self.ping_interval) => {}
            }
        }

        debug!(%url, produced, "prober stopped");
        Ok(produced)
    }
}
