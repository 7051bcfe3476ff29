//! Process exit codes, following sysexits(3).

/// Clean shutdown after a termination signal.
pub const OK: u8 = 0;
/// A required service was unavailable: the probe target after exhausting
/// retries, or the broker.
pub const UNAVAILABLE: u8 = 69;
/// A pipeline task panicked or stopped on its own.
pub const SOFTWARE: u8 = 70;
/// Invalid configuration.
pub const CONFIG: u8 = 78;
