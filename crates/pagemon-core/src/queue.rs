//! Hand-off queue between the prober and the publisher.
//!
//! Single producer, single consumer, FIFO. Unbounded by default; a bounded
//! queue makes [`QueueSender::push`] wait for free capacity.
//!
//! Items still queued when the consumer stops are dropped, not delivered;
//! [`QueueReceiver::discard_remaining`] reports how many.

use tokio::sync::mpsc;

use crate::event::MonitoringEvent;

/// Largest capacity a bounded queue accepts.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Create a queue. `None` selects an unbounded queue.
///
/// A bounded capacity is clamped to `1..=MAX_QUEUE_CAPACITY`.
pub fn event_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.clamp(1, MAX_QUEUE_CAPACITY));
            (QueueSender(Tx::Bounded(tx)), QueueReceiver(Rx::Bounded(rx)))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                QueueSender(Tx::Unbounded(tx)),
                QueueReceiver(Rx::Unbounded(rx)),
            )
        }
    }
}

/// The consumer half went away; the event is handed back.
#[derive(Debug, thiserror::Error)]
#[error("event queue closed")]
pub struct QueueClosed(pub MonitoringEvent);

enum Tx {
    Bounded(mpsc::Sender<MonitoringEvent>),
    Unbounded(mpsc::UnboundedSender<MonitoringEvent>),
}

enum Rx {
    Bounded(mpsc::Receiver<MonitoringEvent>),
    Unbounded(mpsc::UnboundedReceiver<MonitoringEvent>),
}

/// Producer half, owned by the prober.
pub struct QueueSender(Tx);

impl QueueSender {
    /// Enqueue an event, waiting for capacity on a bounded queue.
    pub async fn push(&self, event: MonitoringEvent) -> Result<(), QueueClosed> {
        match &self.0 {
            Tx::Bounded(tx) => tx.send(event).await.map_err(|e| QueueClosed(e.0)),
            Tx::Unbounded(tx) => tx.send(event).map_err(|e| QueueClosed(e.0)),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.0 {
            Tx::Bounded(tx) => tx.is_closed(),
            Tx::Unbounded(tx) => tx.is_closed(),
        }
    }
}

/// Consumer half, owned by the publisher.
pub struct QueueReceiver(Rx);

impl QueueReceiver {
    /// Next event in insertion order; `None` once the producer is gone and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<MonitoringEvent> {
        match &mut self.0 {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Number of events waiting to be consumed.
    pub fn len(&self) -> usize {
        match &self.0 {
            Rx::Bounded(rx) => rx.len(),
            Rx::Unbounded(rx) => rx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and drop everything still in it.
    ///
    /// Returns the number of discarded events.
    pub fn discard_remaining(mut self) -> usize {
        let mut dropped = 0;
        match &mut self.0 {
            Rx::Bounded(rx) => {
                rx.close();
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
            }
            Rx::Unbounded(rx) => {
                rx.close();
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(status: u16) -> MonitoringEvent {
        MonitoringEvent::now("http://q.test", status, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn preserves_insertion_order() {
        let (tx, mut rx) = event_queue(None);
        for status in 200..210 {
            tx.push(event(status)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.http_status);
        }
        assert_eq!(seen, (200..210).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn oversized_capacity_is_clamped() {
        let (tx, mut rx) = event_queue(Some(usize::MAX));
        tx.push(event(200)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().http_status, 200);
    }

    #[tokio::test]
    async fn bounded_queue_preserves_order() {
        let (tx, mut rx) = event_queue(Some(2));
        let producer = tokio::spawn(async move {
            for status in 200..205 {
                tx.push(event(status)).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.http_status);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![200, 201, 202, 203, 204]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_push_waits_for_capacity() {
        let (tx, mut rx) = event_queue(Some(1));
        tx.push(event(200)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_secs(1), tx.push(event(201))).await;
        assert!(blocked.is_err(), "second push should wait while the queue is full");

        assert_eq!(rx.recv().await.unwrap().http_status, 200);
        tx.push(event(202)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().http_status, 202);
    }

    #[tokio::test]
    async fn discard_reports_dropped_events() {
        let (tx, rx) = event_queue(None);
        for status in 0..3 {
            tx.push(event(status)).await.unwrap();
        }
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.discard_remaining(), 3);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn push_after_consumer_gone_returns_event() {
        let (tx, rx) = event_queue(None);
        drop(rx);
        let err = tx.push(event(503)).await.unwrap_err();
        assert_eq!(err.0.http_status, 503);
    }
}
