//! pagemon-probe — availability and latency probes for one endpoint.
//!
//! # Architecture
//!
//! ```text
//! Prober::run
//!   ├── Retry (exponential backoff, no jitter)
//!   │   └── Probe::probe() → ProbeOutcome { status, elapsed }
//!   ├── MonitoringEvent → QueueSender::push()
//!   └── sleep(ping_interval)
//! ```
//!
//! Network-layer failures (DNS, connect, TLS, timeouts) are transient and
//! retried; anything else, or running out of attempts, ends the loop with a
//! [`ProberError`].

pub mod checker;
pub mod monitor;

pub use checker::{HttpProber, Probe, ProbeError, ProbeOutcome};
pub use monitor::{Prober, ProberError};
