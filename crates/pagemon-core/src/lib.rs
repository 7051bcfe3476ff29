//! pagemon-core — shared building blocks for the page monitor pipeline.
//!
//! # Architecture
//!
//! ```text
//! Prober ──► EventQueue ──► Publisher ──► Broker
//!   │            │              │
//!   └── Retry ───┴── Observer ──┘
//! ```
//!
//! - [`event::MonitoringEvent`] is the immutable record produced per probe.
//! - [`config::Config`] is validated once at startup and shared read-only.
//! - [`backoff::Retry`] wraps a fallible operation with exponential delays.
//! - [`queue`] is the single-producer, single-consumer FIFO hand-off.
//! - [`observe::Observer`] receives structured pipeline events; the core
//!   never formats or writes logs itself.

pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod observe;
pub mod queue;

pub use backoff::{BackoffAttempt, BackoffPolicy, Retry, Transient};
pub use config::{BrokerBackend, BrokerConfig, Config, ProbeMethod, RawConfig, TlsMaterial};
pub use error::{ConfigError, ConfigResult};
pub use event::MonitoringEvent;
pub use observe::{
    LifecycleState, Observer, PipelineEvent, ShutdownPhase, TracingObserver,
};
pub use queue::{MAX_QUEUE_CAPACITY, QueueClosed, QueueReceiver, QueueSender, event_queue};
