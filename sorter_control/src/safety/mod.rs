//! Safety subsystem: E-stop monitor and operational-limits watchdog.
//!
//! Highest-priority subsystem. Both loops publish `ForcedTransition`
//! intents on the priority channel the state machine drains first, and
//! never mutate pipeline state themselves.

pub mod estop;
pub mod limits;

pub use estop::{EStopMonitor, ReleaseError};
pub use limits::{LimitAction, LimitsWatchdog, ProcSampler, SystemSampler};
