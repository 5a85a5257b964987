//! PWM belt drive with ramped accel/decel.
//!
//! The scheduler treats speed as instantaneous at the nominal value while
//! the belt is `Running` and refuses to schedule in any other state, so
//! `nominal_speed_mps` reports zero during ramps. Ramp progress is
//! tick-driven from the control loop; emergency stop cuts power without
//! ramping and latches until explicitly cleared.

use std::sync::Arc;

use tracing::{debug, info, warn};

use sorter_common::clock::NANOS_PER_SEC;
use sorter_common::config::ConveyorBeltSettings;

use crate::gpio::{GpioBackend, HalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BeltState {
    Stopped = 0,
    Accelerating = 1,
    Running = 2,
    Decelerating = 3,
    EmergencyStop = 4,
}

impl BeltState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Accelerating => "accelerating",
            Self::Running => "running",
            Self::Decelerating => "decelerating",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

pub struct BeltController {
    backend: Arc<dyn GpioBackend>,
    pwm_pin: u8,
    pwm_frequency_hz: f64,
    min_duty: f64,
    max_duty: f64,
    max_speed_mps: f64,
    accel_ns: u64,
    decel_ns: u64,

    state: BeltState,
    /// Speed the current ramp is heading to [m/s].
    target_mps: f64,
    /// Instantaneous (modeled) speed [m/s].
    current_mps: f64,
    ramp_from_mps: f64,
    ramp_started_ns: u64,
    /// Speed to restore on resume after a pause.
    resume_target_mps: f64,
}

impl BeltController {
    pub fn from_settings(
        settings: &ConveyorBeltSettings,
        backend: Arc<dyn GpioBackend>,
    ) -> Self {
        Self {
            backend,
            pwm_pin: settings.pwm_pin_bcm,
            pwm_frequency_hz: settings.pwm_frequency_hz,
            min_duty: settings.min_duty_cycle,
            max_duty: settings.max_duty_cycle,
            max_speed_mps: settings.max_speed_mps,
            accel_ns: (settings.accel_time_s * NANOS_PER_SEC as f64) as u64,
            decel_ns: (settings.decel_time_s * NANOS_PER_SEC as f64) as u64,
            state: BeltState::Stopped,
            target_mps: 0.0,
            current_mps: 0.0,
            ramp_from_mps: 0.0,
            ramp_started_ns: 0,
            resume_target_mps: settings.belt_speed_mps,
        }
    }

    #[inline]
    pub const fn state(&self) -> BeltState {
        self.state
    }

    /// Speed the scheduler may plan against: the nominal target while
    /// running, zero in every other state.
    #[inline]
    pub fn nominal_speed_mps(&self) -> f64 {
        if self.state == BeltState::Running {
            self.target_mps
        } else {
            0.0
        }
    }

    /// Modeled instantaneous speed (ramps included), for diagnostics.
    #[inline]
    pub fn current_speed_mps(&self) -> f64 {
        self.current_mps
    }

    /// Begin a ramped start toward `target_mps`.
    pub fn start(&mut self, target_mps: f64, now_ns: u64) -> Result<(), HalError> {
        if self.state == BeltState::EmergencyStop {
            return Err(HalError::Rejected(
                "belt latched in emergency stop".into(),
            ));
        }
        if target_mps <= 0.0 || target_mps > self.max_speed_mps {
            return Err(HalError::Rejected(format!(
                "target speed {target_mps} m/s outside (0, {}]",
                self.max_speed_mps
            )));
        }
        self.target_mps = target_mps;
        self.resume_target_mps = target_mps;
        self.ramp_from_mps = self.current_mps;
        self.ramp_started_ns = now_ns;
        self.state = BeltState::Accelerating;
        info!(target_mps, "belt start");
        self.apply_duty()
    }

    /// Stop, ramped or immediate.
    pub fn stop(&mut self, ramped: bool, now_ns: u64) -> Result<(), HalError> {
        if self.state == BeltState::EmergencyStop {
            return Ok(());
        }
        if ramped && self.current_mps > 0.0 {
            self.target_mps = 0.0;
            self.ramp_from_mps = self.current_mps;
            self.ramp_started_ns = now_ns;
            self.state = BeltState::Decelerating;
        } else {
            self.target_mps = 0.0;
            self.current_mps = 0.0;
            self.state = BeltState::Stopped;
        }
        debug!(ramped, "belt stop");
        self.apply_duty()
    }

    /// Ramped stop that remembers the speed for `resume`.
    pub fn pause(&mut self, now_ns: u64) -> Result<(), HalError> {
        if self.state == BeltState::Running || self.state == BeltState::Accelerating {
            self.resume_target_mps = if self.target_mps > 0.0 {
                self.target_mps
            } else {
                self.resume_target_mps
            };
        }
        self.stop(true, now_ns)
    }

    /// Resume at the pre-pause speed.
    pub fn resume(&mut self, now_ns: u64) -> Result<(), HalError> {
        self.start(self.resume_target_mps, now_ns)
    }

    /// Immediate power-off, latched until `clear_emergency`.
    pub fn emergency_stop(&mut self) -> Result<(), HalError> {
        warn!("belt emergency stop");
        self.state = BeltState::EmergencyStop;
        self.target_mps = 0.0;
        self.current_mps = 0.0;
        self.backend.set_pwm(self.pwm_pin, self.pwm_frequency_hz, 0.0)
    }

    /// Operator reset after an emergency stop.
    pub fn clear_emergency(&mut self) {
        if self.state == BeltState::EmergencyStop {
            self.state = BeltState::Stopped;
        }
    }

    /// Advance the ramp model and push the duty cycle out.
    pub fn tick(&mut self, now_ns: u64) -> Result<(), HalError> {
        match self.state {
            BeltState::Accelerating | BeltState::Decelerating => {
                let ramp_ns = if self.state == BeltState::Accelerating {
                    self.accel_ns
                } else {
                    self.decel_ns
                };
                let progress = if ramp_ns == 0 {
                    1.0
                } else {
                    ((now_ns.saturating_sub(self.ramp_started_ns)) as f64 / ramp_ns as f64)
                        .min(1.0)
                };
                self.current_mps =
                    self.ramp_from_mps + (self.target_mps - self.ramp_from_mps) * progress;
                if progress >= 1.0 {
                    self.state = if self.target_mps > 0.0 {
                        BeltState::Running
                    } else {
                        BeltState::Stopped
                    };
                    debug!(state = self.state.as_str(), "belt ramp complete");
                }
                self.apply_duty()
            }
            BeltState::Running | BeltState::Stopped | BeltState::EmergencyStop => Ok(()),
        }
    }

    fn duty_for(&self, speed_mps: f64) -> f64 {
        if speed_mps <= 0.0 {
            return 0.0;
        }
        let fraction = (speed_mps / self.max_speed_mps).clamp(0.0, 1.0);
        self.min_duty + (self.max_duty - self.min_duty) * fraction
    }

    fn apply_duty(&mut self) -> Result<(), HalError> {
        let duty = self.duty_for(self.current_mps);
        self.backend
            .set_pwm(self.pwm_pin, self.pwm_frequency_hz, duty)
    }
}
