//! In-process broker with scripted acknowledgments.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::broker::{
    Broker, BrokerError, DeliveryError, DeliveryHandle, DeliveryMetadata, DeliveryNotifier, Record,
};

/// How [`MemoryBroker`] acknowledges records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge on submit.
    Immediate,
    /// Acknowledge after a delay.
    Delayed(Duration),
    /// Reject every record with the given reason.
    Fail(String),
    /// Hold acknowledgments until [`MemoryBroker::release`] is called.
    Manual,
}

/// Broker that keeps every submitted record in memory.
pub struct MemoryBroker {
    mode: Mutex<AckMode>,
    records: Mutex<Vec<Record>>,
    held: Mutex<Vec<(DeliveryNotifier, DeliveryMetadata)>>,
    unavailable: Mutex<Option<String>>,
    next_offset: AtomicI64,
    flushes: AtomicU64,
}

impl MemoryBroker {
    /// Broker acknowledging every record at once.
    pub fn new() -> Self {
        Self::with_mode(AckMode::Immediate)
    }

    /// Broker acknowledging records according to `mode`.
    pub fn with_mode(mode: AckMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            records: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            unavailable: Mutex::new(None),
            next_offset: AtomicI64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn set_mode(&self, mode: AckMode) {
        *lock(&self.mode) = mode;
    }

    /// Make every later `publish` fail as if the client died.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *lock(&self.unavailable) = Some(reason.into());
    }

    /// Records submitted so far, in submission order.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    /// Number of acknowledgments held in [`AckMode::Manual`].
    pub fn held(&self) -> usize {
        lock(&self.held).len()
    }

    /// Acknowledge every held record successfully. Returns how many.
    pub fn release(&self) -> usize {
        let held: Vec<_> = lock(&self.held).drain(..).collect();
        let count = held.len();
        for (notifier, meta) in held {
            notifier.notify(Ok(meta));
        }
        count
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish(&self, record: Record) -> Result<DeliveryHandle, BrokerError> {
        if let Some(reason) = lock(&self.unavailable).clone() {
            return Err(BrokerError::Unavailable(reason));
        }

        let meta = DeliveryMetadata {
            topic: record.topic.clone(),
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        };
        lock(&self.records).push(record);

        let mode = lock(&self.mode).clone();
        let handle = match mode {
            AckMode::Immediate => DeliveryHandle::resolved(Ok(meta)),
            AckMode::Fail(reason) => DeliveryHandle::resolved(Err(DeliveryError::Rejected(reason))),
            AckMode::Delayed(delay) => {
                let (notifier, handle) = DeliveryHandle::channel();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notifier.notify(Ok(meta));
                });
                handle
            }
            AckMode::Manual => {
                let (notifier, handle) = DeliveryHandle::channel();
                lock(&self.held).push((notifier, meta));
                handle
            }
        };
        Ok(handle)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u8) -> Record {
        Record {
            topic: "t".into(),
            key: vec![n],
            payload: vec![n],
        }
    }

    #[tokio::test]
    async fn immediate_mode_assigns_increasing_offsets() {
        let broker = MemoryBroker::new();
        let a = broker.publish(record(1)).unwrap().await.unwrap();
        let b = broker.publish(record(2)).unwrap().await.unwrap();
        assert_eq!((a.partition, a.offset), (0, 0));
        assert_eq!(b.offset, 1);
        assert_eq!(broker.records().len(), 2);
    }

    #[tokio::test]
    async fn manual_mode_holds_until_released() {
        let broker = MemoryBroker::with_mode(AckMode::Manual);
        let handle = broker.publish(record(1)).unwrap();
        assert_eq!(broker.held(), 1);
        assert_eq!(broker.release(), 1);
        assert_eq!(handle.await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn fail_mode_rejects() {
        let broker = MemoryBroker::with_mode(AckMode::Fail("too large".into()));
        let err = broker.publish(record(1)).unwrap().await.unwrap_err();
        assert_eq!(err, DeliveryError::Rejected("too large".into()));
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_publish() {
        let broker = MemoryBroker::new();
        broker.set_unavailable("gone");
        assert!(matches!(
            broker.publish(record(1)),
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.records().is_empty());
    }

    #[tokio::test]
    async fn flush_is_counted() {
        let broker = MemoryBroker::new();
        broker.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(broker.flush_count(), 1);
    }
}
