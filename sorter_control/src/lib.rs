//! # Sorter Control Library
//!
//! Real-time orchestration core for the industrial sorter: turns
//! asynchronous camera-trigger events into precisely timed diverter
//! pulses while a safety supervisor, recovery supervisor and bin monitor
//! observe and pre-empt the pipeline.
//!
//! ## Architecture
//!
//! 1. **State machine**: single writer of the global system state;
//!    safety intents arrive on a priority channel drained first.
//! 2. **Dispatch scheduler**: exclusive owner of the pending-fire queue;
//!    computes fire times from belt speed and per-category distances,
//!    serializes overlapping activations, drops late or gated items.
//! 3. **Safety supervisor**: E-stop loop plus operational-limits
//!    watchdog with hysteresis; highest priority over pipeline state.
//! 4. **Recovery supervisor**: the only retry authority; per-fault-kind
//!    strategies with cooldowns and a global restart budget.
//! 5. **Telemetry bus**: non-blocking fan-out with per-subscriber
//!    bounded buffers and drop policies.
//!
//! All mutable state crosses task boundaries through bounded channels;
//! cores are tick-driven with explicit timestamps so every timing
//! property is assertable under a virtual clock.

pub mod bins;
pub mod classifier;
pub mod machine;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod safety;
pub mod scheduler;
pub mod telemetry;
