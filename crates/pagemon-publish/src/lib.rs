//! pagemon-publish — broker clients and the publisher loop.
//!
//! ```text
//! QueueReceiver ──▶ Publisher::run ──▶ Broker::publish ──▶ DeliveryHandle
//!                        │                                       │
//!                        └──────── JoinSet of pending acks ◀─────┘
//! ```
//!
//! Backends: [`StreamBroker`] (JSON lines, stdout by default),
//! [`MemoryBroker`] for tests and, with the `kafka` feature, `KafkaBroker`.

pub mod broker;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod publisher;
pub mod stream;

pub use broker::{
    Broker, BrokerError, DeliveryError, DeliveryHandle, DeliveryMetadata, DeliveryNotifier,
    DeliveryResult, Record,
};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::{AckMode, MemoryBroker};
pub use publisher::{FlushReport, PublishStats, Publisher};
pub use stream::{StdoutBroker, StreamBroker};
