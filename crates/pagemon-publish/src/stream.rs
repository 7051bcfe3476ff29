//! Broker that writes records as JSON lines to a byte stream.
//!
//! Used with stdout to run the monitor without a broker. Each line is the
//! record payload; the acknowledgment carries partition 0 and a running
//! offset.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::broker::{
    Broker, BrokerError, DeliveryError, DeliveryHandle, DeliveryMetadata, Record,
};

/// [`StreamBroker`] writing to the process stdout.
pub type StdoutBroker = StreamBroker<std::io::Stdout>;

/// Broker writing each record as one JSON line to a stream.
pub struct StreamBroker<W> {
    out: Mutex<W>,
    next_offset: Mutex<i64>,
}

impl StdoutBroker {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> StreamBroker<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            next_offset: Mutex::new(0),
        }
    }

    /// Consume the broker and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send + 'static> Broker for StreamBroker<W> {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn publish(&self, record: Record) -> Result<DeliveryHandle, BrokerError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| BrokerError::Unavailable("output stream poisoned".to_string()))?;

        let written = out
            .write_all(&record.payload)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(e) = written {
            return Ok(DeliveryHandle::resolved(Err(DeliveryError::Rejected(
                e.to_string(),
            ))));
        }

        let mut next = self
            .next_offset
            .lock()
            .map_err(|_| BrokerError::Unavailable("offset counter poisoned".to_string()))?;
        let offset = *next;
        *next += 1;

        Ok(DeliveryHandle::resolved(Ok(DeliveryMetadata {
            topic: record.topic,
            partition: 0,
            offset,
        })))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| BrokerError::Unavailable("output stream poisoned".to_string()))?;
        out.flush().map_err(|e| BrokerError::Flush(e.to_string()))?;
        debug!("stream broker flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &str) -> Record {
        Record {
            topic: "metrics".into(),
            key: b"k".to_vec(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn writes_one_line_per_record() {
        let broker = StreamBroker::new(Vec::new());
        let first = broker.publish(record(r#"{"a":1}"#)).unwrap().await.unwrap();
        let second = broker.publish(record(r#"{"a":2}"#)).unwrap().await.unwrap();
        broker.flush(Duration::from_secs(1)).await.unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(second.topic, "metrics");
        let out = String::from_utf8(broker.into_inner()).unwrap();
        assert_eq!(out, "{\"a\":1}\n{\"a\":2}\n");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_errors_fail_the_delivery_only() {
        let broker = StreamBroker::new(Broken);
        let outcome = broker.publish(record("{}")).unwrap().await;
        assert!(matches!(outcome, Err(DeliveryError::Rejected(_))));
    }
}
