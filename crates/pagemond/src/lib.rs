//! pagemond — wires the prober and the publisher into one daemon.
//!
//! The binary builds the configuration from flags, environment and an
//! optional TOML file, constructs the probe and broker clients, and hands
//! them to the [`Coordinator`], which owns the process lifecycle until
//! shutdown.

pub mod cli;
pub mod coordinator;
pub mod exit;
pub mod signals;

pub use cli::{Cli, LogFormat};
pub use coordinator::{Coordinator, Outcome, ShutdownReason};
pub use signals::{ShutdownSignals, Signal};
