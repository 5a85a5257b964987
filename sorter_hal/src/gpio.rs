//! GPIO backend trait and the simulation backend.
//!
//! Real GPIO/PWM primitives are external collaborators; this module pins
//! down the capability the rest of the HAL programs against, plus a
//! simulation backend with scripted inputs and a recorded write log for
//! tests and off-target runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

/// Digital logic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[inline]
    pub const fn from_bool(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }

    #[inline]
    pub const fn is_high(&self) -> bool {
        matches!(self, Self::High)
    }

    #[inline]
    pub const fn toggled(&self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

/// Error type for HAL operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HalError {
    /// Initialization failed.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// GPIO read failed.
    #[error("GPIO read failed on pin {pin}: {reason}")]
    Read { pin: u8, reason: String },

    /// GPIO write failed.
    #[error("GPIO write failed on pin {pin}: {reason}")]
    Write { pin: u8, reason: String },

    /// PWM configuration failed.
    #[error("PWM setup failed on pin {pin}: {reason}")]
    Pwm { pin: u8, reason: String },

    /// Pin already owned by another component.
    #[error("pin {pin} already claimed by '{owner}' (claimant '{claimant}')")]
    PinConflict {
        pin: u8,
        owner: String,
        claimant: String,
    },

    /// A second activation was requested while one is in flight.
    #[error("activation already in progress")]
    ActivationInProgress,

    /// Command not legal in the component's current state.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The actuator is disabled (supervisor or operator).
    #[error("actuator disabled")]
    ActuatorDisabled,

    /// Ultrasonic echo did not return within the hard timeout.
    #[error("echo timeout after {timeout_s}s on pin {pin}")]
    EchoTimeout { pin: u8, timeout_s: f64 },
}

/// Capability the HAL programs against.
///
/// Implementations must be cheap to call from multiple threads; each pin
/// is only ever touched by its owning component.
pub trait GpioBackend: Send + Sync {
    /// Read a digital input.
    fn read(&self, pin: u8) -> Result<Level, HalError>;

    /// Drive a digital output.
    fn write(&self, pin: u8, level: Level) -> Result<(), HalError>;

    /// Configure PWM on a pin. `duty_pct` is `0..=100`.
    fn set_pwm(&self, pin: u8, frequency_hz: f64, duty_pct: f64) -> Result<(), HalError>;

    /// Trigger an ultrasonic measurement and return the echo duration.
    ///
    /// Real backends bit-bang the trigger pulse and time the echo edge;
    /// the simulation backend returns scripted durations.
    fn measure_echo(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        timeout: Duration,
    ) -> Result<Duration, HalError>;
}

// ─── Simulation Backend ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    /// Input levels, scripted by tests via `set_input`.
    inputs: HashMap<u8, Level>,
    /// Last written output level per pin.
    outputs: HashMap<u8, Level>,
    /// Last PWM setting per pin: (frequency_hz, duty_pct).
    pwm: HashMap<u8, (f64, f64)>,
    /// Every digital write in order, for assertions.
    write_log: Vec<(u8, Level)>,
    /// Scripted echo durations per trigger pin (FIFO).
    echoes: HashMap<u8, VecDeque<Option<Duration>>>,
    /// Pins whose writes are scripted to fail.
    failing_pins: HashSet<u8>,
}

/// In-memory GPIO backend for tests and `--simulate` runs.
///
/// Inputs read scripted levels (default low). Writes are recorded.
/// Echo measurements pop scripted durations; `None` entries simulate a
/// timeout. Writes to pins marked failing return `HalError::Write`.
#[derive(Debug, Default)]
pub struct SimBackend {
    state: Mutex<SimState>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a digital input level.
    pub fn set_input(&self, pin: u8, level: Level) {
        self.state.lock().inputs.insert(pin, level);
    }

    /// Queue an echo duration for the next measurement on `trigger_pin`.
    pub fn push_echo(&self, trigger_pin: u8, duration: Duration) {
        self.state
            .lock()
            .echoes
            .entry(trigger_pin)
            .or_default()
            .push_back(Some(duration));
    }

    /// Queue an echo timeout for the next measurement on `trigger_pin`.
    pub fn push_echo_timeout(&self, trigger_pin: u8) {
        self.state
            .lock()
            .echoes
            .entry(trigger_pin)
            .or_default()
            .push_back(None);
    }

    /// Script writes on a pin to fail (injects `hardware_failure` paths).
    pub fn fail_pin(&self, pin: u8) {
        self.state.lock().failing_pins.insert(pin);
    }

    /// Stop failing a pin.
    pub fn heal_pin(&self, pin: u8) {
        self.state.lock().failing_pins.remove(&pin);
    }

    /// Last written level on a pin, if any.
    pub fn output(&self, pin: u8) -> Option<Level> {
        self.state.lock().outputs.get(&pin).copied()
    }

    /// Last PWM setting on a pin: (frequency_hz, duty_pct).
    pub fn pwm(&self, pin: u8) -> Option<(f64, f64)> {
        self.state.lock().pwm.get(&pin).copied()
    }

    /// Number of low→high transitions written to a pin.
    pub fn rising_edges(&self, pin: u8) -> usize {
        let state = self.state.lock();
        let mut count = 0;
        let mut last = Level::Low;
        for (p, level) in &state.write_log {
            if *p == pin {
                if !last.is_high() && level.is_high() {
                    count += 1;
                }
                last = *level;
            }
        }
        count
    }

    /// Snapshot of the write log.
    pub fn writes(&self) -> Vec<(u8, Level)> {
        self.state.lock().write_log.clone()
    }
}

impl GpioBackend for SimBackend {
    fn read(&self, pin: u8) -> Result<Level, HalError> {
        Ok(self
            .state
            .lock()
            .inputs
            .get(&pin)
            .copied()
            .unwrap_or(Level::Low))
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.failing_pins.contains(&pin) {
            return Err(HalError::Write {
                pin,
                reason: "simulated write fault".into(),
            });
        }
        state.outputs.insert(pin, level);
        state.write_log.push((pin, level));
        Ok(())
    }

    fn set_pwm(&self, pin: u8, frequency_hz: f64, duty_pct: f64) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.failing_pins.contains(&pin) {
            return Err(HalError::Pwm {
                pin,
                reason: "simulated PWM fault".into(),
            });
        }
        state.pwm.insert(pin, (frequency_hz, duty_pct));
        Ok(())
    }

    fn measure_echo(
        &self,
        trigger_pin: u8,
        _echo_pin: u8,
        timeout: Duration,
    ) -> Result<Duration, HalError> {
        let scripted = self
            .state
            .lock()
            .echoes
            .get_mut(&trigger_pin)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(Some(duration)) => Ok(duration),
            // No script or an explicit timeout entry both time out.
            Some(None) | None => Err(HalError::EchoTimeout {
                pin: trigger_pin,
                timeout_s: timeout.as_secs_f64(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_default_low() {
        let backend = SimBackend::new();
        assert_eq!(backend.read(4).unwrap(), Level::Low);
        backend.set_input(4, Level::High);
        assert_eq!(backend.read(4).unwrap(), Level::High);
    }

    #[test]
    fn writes_are_recorded() {
        let backend = SimBackend::new();
        backend.write(5, Level::High).unwrap();
        backend.write(5, Level::Low).unwrap();
        assert_eq!(backend.output(5), Some(Level::Low));
        assert_eq!(
            backend.writes(),
            vec![(5, Level::High), (5, Level::Low)]
        );
    }

    #[test]
    fn rising_edge_count() {
        let backend = SimBackend::new();
        for _ in 0..3 {
            backend.write(6, Level::High).unwrap();
            backend.write(6, Level::Low).unwrap();
        }
        assert_eq!(backend.rising_edges(6), 3);
        assert_eq!(backend.rising_edges(7), 0);
    }

    #[test]
    fn failing_pin_rejects_writes() {
        let backend = SimBackend::new();
        backend.fail_pin(9);
        assert!(matches!(
            backend.write(9, Level::High),
            Err(HalError::Write { pin: 9, .. })
        ));
        backend.heal_pin(9);
        backend.write(9, Level::High).unwrap();
    }

    #[test]
    fn scripted_echo_fifo() {
        let backend = SimBackend::new();
        backend.push_echo(10, Duration::from_micros(1000));
        backend.push_echo_timeout(10);
        assert_eq!(
            backend
                .measure_echo(10, 11, Duration::from_millis(100))
                .unwrap(),
            Duration::from_micros(1000)
        );
        assert!(matches!(
            backend.measure_echo(10, 11, Duration::from_millis(100)),
            Err(HalError::EchoTimeout { pin: 10, .. })
        ));
        // Unscripted measurement also times out.
        assert!(backend
            .measure_echo(10, 11, Duration::from_millis(100))
            .is_err());
    }

    #[test]
    fn pwm_recorded() {
        let backend = SimBackend::new();
        backend.set_pwm(18, 1000.0, 42.0).unwrap();
        assert_eq!(backend.pwm(18), Some((1000.0, 42.0)));
    }
}
