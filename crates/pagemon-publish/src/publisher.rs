//! The publisher loop.
//!
//! Consumes events from the hand-off queue in order, submits each one to the
//! broker and tracks the delivery handles in flight. Failed deliveries are
//! reported and dropped: there is no redelivery, so a record is published at
//! most once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use pagemon_core::{MonitoringEvent, Observer, PipelineEvent, QueueReceiver};

use crate::broker::{Broker, BrokerError, DeliveryError, DeliveryResult, Record};

/// Delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Records handed to the broker client.
    pub submitted: u64,
    pub delivered: u64,
    /// Submitted records the broker reported as lost.
    pub failed: u64,
    /// Events dropped before submission because they could not be encoded.
    pub unencodable: u64,
    /// Deliveries still without an outcome when a flush timed out.
    pub abandoned: u64,
}

impl PublishStats {
    /// Submitted records still waiting for an outcome.
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.delivered)
            .saturating_sub(self.failed)
            .saturating_sub(self.abandoned)
    }
}

/// Result of a shutdown flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub stats: PublishStats,
    /// `false` if the timeout expired with deliveries outstanding.
    pub completed: bool,
}

/// Queue consumer publishing to a broker.
pub struct Publisher<B> {
    broker: Arc<B>,
    topic: String,
    observer: Arc<dyn Observer>,
    in_flight: JoinSet<(String, DeliveryResult)>,
    stats: PublishStats,
}

impl<B: Broker> Publisher<B> {
    /// A publisher with no deliveries in flight.
    pub fn new(broker: Arc<B>, topic: impl Into<String>, observer: Arc<dyn Observer>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            observer,
            in_flight: JoinSet::new(),
            stats: PublishStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Deliveries submitted but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Consume `queue` until it ends or `shutdown` turns `true`.
    ///
    /// Once shutdown is observed no further event is taken from the queue.
    /// Acknowledgments keep being collected while the loop runs; whatever is
    /// still in flight afterwards is settled by [`Publisher::flush`].
    pub async fn run(
        &mut self,
        queue: &mut QueueReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        debug!(broker = self.broker.name(), topic = %self.topic, "publisher starting");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.settle(joined);
                }
                next = queue.recv() => match next {
                    Some(event) => self.submit(&event)?,
                    None => break,
                },
            }
        }

        debug!(stats = ?self.stats, in_flight = self.in_flight.len(), "publisher stopped");
        Ok(())
    }

    /// Submit one event. Only a broker-level failure is an error.
    pub fn submit(&mut self, event: &MonitoringEvent) -> Result<(), BrokerError> {
        let key = event.url.clone();
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.unencodable += 1;
                self.observer.on_event(&PipelineEvent::DeliveryFailed {
                    key,
                    error: DeliveryError::Encode(e.to_string()).to_string(),
                });
                return Ok(());
            }
        };

        let handle = self.broker.publish(Record {
            topic: self.topic.clone(),
            key: key.clone().into_bytes(),
            payload,
        })?;
        self.stats.submitted += 1;
        self.observer.on_event(&PipelineEvent::Submitted {
            topic: self.topic.clone(),
            key: key.clone(),
        });

        self.in_flight.spawn(async move { (key, handle.await) });
        Ok(())
    }

    /// Flush the broker and wait, up to `timeout` overall, for every
    /// submitted record to reach an outcome.
    ///
    /// Deliveries still pending at the deadline are abandoned and counted.
    pub async fn flush(&mut self, timeout: Duration) -> FlushReport {
        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, self.broker.flush(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "broker flush failed"),
            Err(_) => debug!("broker flush hit the deadline"),
        }

        let mut completed = true;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next()).await {
                Ok(Some(joined)) => self.settle(joined),
                Ok(None) => break,
                Err(_) => {
                    let outstanding = self.in_flight.len();
                    self.observer.on_event(&PipelineEvent::FlushTimedOut {
                        outstanding,
                        timeout,
                    });
                    self.in_flight.abort_all();
                    self.stats.abandoned += outstanding as u64;
                    completed = false;
                    break;
                }
            }
        }

        FlushReport {
            stats: self.stats,
            completed,
        }
    }

    fn settle(&mut self, joined: Result<(String, DeliveryResult), JoinError>) {
        match joined {
            Ok((_, Ok(meta))) => {
                self.stats.delivered += 1;
                self.observer.on_event(&PipelineEvent::Delivered {
                    topic: meta.topic,
                    partition: meta.partition,
                    offset: meta.offset,
                });
            }
            Ok((key, Err(e))) => self.record_failure(&key, &e),
            Err(e) => self.record_failure("<unknown>", &DeliveryError::Rejected(e.to_string())),
        }
    }

    fn record_failure(&mut self, key: &str, error: &DeliveryError) {
        self.stats.failed += 1;
        self.observer.on_event(&PipelineEvent::DeliveryFailed {
            key: key.to_string(),
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AckMode, MemoryBroker};
    use pagemon_core::event_queue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PipelineEvent>>);

    impl Observer for Recorder {
        fn on_event(&self, event: &PipelineEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
            self.0.lock().unwrap().iter().filter(|e| pred(*e)).count()
        }
    }

    fn event(n: u64) -> MonitoringEvent {
        MonitoringEvent::now(
            format!("http://site-{n}.test"),
            200,
            Duration::from_micros(n),
        )
    }

    #[tokio::test]
    async fn publishes_in_queue_order() {
        let broker = Arc::new(MemoryBroker::new());
        let recorder = Arc::new(Recorder::default());
        let mut publisher = Publisher::new(broker.clone(), "metrics", recorder.clone());
        let (tx, mut rx) = event_queue(None);
        let (_stop_tx, stop_rx) = watch::channel(false);

        for n in 0..20 {
            tx.push(event(n)).await.unwrap();
        }
        drop(tx);

        publisher.run(&mut rx, stop_rx).await.unwrap();
        let report = publisher.flush(Duration::from_secs(1)).await;

        let records = broker.records();
        assert_eq!(records.len(), 20);
        for (n, record) in records.iter().enumerate() {
            assert_eq!(record.topic, "metrics");
            assert_eq!(record.key_lossy(), format!("http://site-{n}.test"));
            let decoded: MonitoringEvent = serde_json::from_slice(&record.payload).unwrap();
            assert_eq!(decoded.response_time_micros(), n as u64);
        }
        assert!(report.completed);
        assert_eq!(report.stats.submitted, 20);
        assert_eq!(report.stats.delivered, 20);
        assert_eq!(report.stats.outstanding(), 0);
        assert_eq!(
            recorder.count(|e| matches!(e, PipelineEvent::Delivered { .. })),
            20
        );
    }

    #[tokio::test]
    async fn delivery_failures_are_logged_not_retried() {
        let broker = Arc::new(MemoryBroker::with_mode(AckMode::Fail(
            "leader not available".into(),
        )));
        let recorder = Arc::new(Recorder::default());
        let mut publisher = Publisher::new(broker.clone(), "metrics", recorder.clone());
        let (tx, mut rx) = event_queue(None);
        let (_stop_tx, stop_rx) = watch::channel(false);

        for n in 0..3 {
            tx.push(event(n)).await.unwrap();
        }
        drop(tx);

        publisher.run(&mut rx, stop_rx).await.unwrap();
        let report = publisher.flush(Duration::from_secs(1)).await;

        // Each record was submitted exactly once.
        assert_eq!(broker.records().len(), 3);
        assert_eq!(report.stats.failed, 3);
        assert_eq!(report.stats.delivered, 0);
        assert_eq!(
            recorder.count(|e| matches!(e, PipelineEvent::DeliveryFailed { .. })),
            3
        );
    }

    #[tokio::test]
    async fn unusable_broker_is_fatal() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable("fatal idempotence error");
        let mut publisher = Publisher::new(broker, "metrics", Arc::new(Recorder::default()));
        let (tx, mut rx) = event_queue(None);
        let (_stop_tx, stop_rx) = watch::channel(false);

        tx.push(event(1)).await.unwrap();
        let err = publisher.run(&mut rx, stop_rx).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_consuming_but_flush_settles_in_flight() {
        let broker = Arc::new(MemoryBroker::with_mode(AckMode::Delayed(Duration::from_secs(2))));
        let mut publisher = Publisher::new(broker.clone(), "metrics", Arc::new(Recorder::default()));
        let (tx, mut rx) = event_queue(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        for n in 0..3 {
            tx.push(event(n)).await.unwrap();
        }

        let run = async {
            publisher.run(&mut rx, stop_rx).await.unwrap();
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop_tx.send(true).unwrap();
        };
        tokio::join!(run, stop);

        assert_eq!(publisher.in_flight(), 3);
        let report = publisher.flush(Duration::from_secs(5)).await;
        assert!(report.completed);
        assert_eq!(report.stats.delivered, 3);

        // Pushed after shutdown: never consumed.
        tx.push(event(9)).await.unwrap();
        assert_eq!(rx.discard_remaining(), 1);
        assert_eq!(broker.records().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_gives_up_at_the_timeout() {
        let broker = Arc::new(MemoryBroker::with_mode(AckMode::Manual));
        let recorder = Arc::new(Recorder::default());
        let mut publisher = Publisher::new(broker.clone(), "metrics", recorder.clone());

        publisher.submit(&event(1)).unwrap();
        publisher.submit(&event(2)).unwrap();

        let started = Instant::now();
        let report = publisher.flush(Duration::from_secs(3)).await;
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(!report.completed);
        assert_eq!(report.stats.abandoned, 2);
        assert_eq!(report.stats.outstanding(), 0);
        assert_eq!(
            recorder.count(|e| matches!(e, PipelineEvent::FlushTimedOut { outstanding: 2, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgments_are_collected_while_running() {
        let broker = Arc::new(MemoryBroker::with_mode(AckMode::Delayed(Duration::from_millis(10))));
        let mut publisher = Publisher::new(broker, "metrics", Arc::new(Recorder::default()));
        let (tx, mut rx) = event_queue(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        tx.push(event(1)).await.unwrap();
        let run = async {
            publisher.run(&mut rx, stop_rx).await.unwrap();
        };
        let stop = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop_tx.send(true).unwrap();
        };
        tokio::join!(run, stop);

        assert_eq!(publisher.in_flight(), 0);
        assert_eq!(publisher.stats().delivered, 1);
    }

    #[test]
    fn unencodable_events_are_not_outstanding() {
        let stats = PublishStats {
            unencodable: 1,
            ..PublishStats::default()
        };
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn outstanding_never_underflows() {
        let stats = PublishStats {
            submitted: 1,
            delivered: 1,
            failed: 1,
            ..PublishStats::default()
        };
        assert_eq!(stats.outstanding(), 0);

        let pending = PublishStats {
            submitted: 4,
            delivered: 1,
            failed: 1,
            ..PublishStats::default()
        };
        assert_eq!(pending.outstanding(), 2);
    }
}
