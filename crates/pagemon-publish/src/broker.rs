//! Broker publish API.
//!
//! Submitting a record never waits for the broker. The acknowledgment
//! arrives later through the returned [`DeliveryHandle`], which resolves
//! once the broker accepted or rejected the record.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// One message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Record {
    /// Key rendered for logs.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Where an accepted record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Why a single record was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("message could not be encoded: {0}")]
    Encode(String),

    #[error("delivery acknowledgment was dropped")]
    Dropped,
}

pub type DeliveryResult = Result<DeliveryMetadata, DeliveryError>;

/// Broker-level failures. Any of these ends the publisher.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("broker client is unusable: {0}")]
    Unavailable(String),

    #[error("flush failed: {0}")]
    Flush(String),
}

/// Sending half of a delivery acknowledgment.
#[derive(Debug)]
pub struct DeliveryNotifier(oneshot::Sender<DeliveryResult>);

impl DeliveryNotifier {
    /// Report the outcome. A dropped handle is not an error.
    pub fn notify(self, result: DeliveryResult) {
        let _ = self.0.send(result);
    }
}

/// Pending delivery outcome for one record.
#[derive(Debug)]
pub struct DeliveryHandle(oneshot::Receiver<DeliveryResult>);

impl DeliveryHandle {
    /// A handle plus the notifier that resolves it.
    pub fn channel() -> (DeliveryNotifier, DeliveryHandle) {
        let (tx, rx) = oneshot::channel();
        (DeliveryNotifier(tx), DeliveryHandle(rx))
    }

    /// A handle that is already resolved.
    pub fn resolved(result: DeliveryResult) -> Self {
        let (notifier, handle) = Self::channel();
        notifier.notify(result);
        handle
    }
}

impl Future for DeliveryHandle {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(DeliveryError::Dropped)))
    }
}

/// A message broker client.
///
/// Only the publisher task calls into the client, so implementations need
/// no internal coordination beyond what their own delivery path requires.
pub trait Broker: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Submit a record without waiting for acknowledgment.
    ///
    /// `Err` means the client can no longer publish at all. Per-record
    /// failures are reported through the handle instead.
    fn publish(&self, record: Record) -> Result<DeliveryHandle, BrokerError>;

    /// Wait, up to `timeout`, for submitted records to be handed to the broker.
    fn flush(&self, timeout: Duration) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
