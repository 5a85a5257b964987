//! Emergency-stop monitor.
//!
//! Assertion is level-triggered and latches; release requires the input
//! to be physically clear and an operator acknowledgement. Repeated
//! failed release attempts lock the release path out for the configured
//! duration.

use tracing::{error, info, warn};

use sorter_common::clock::secs_to_ns;
use sorter_common::config::SafetySettings;

/// Why an E-stop release was refused.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReleaseError {
    #[error("E-stop input still asserted")]
    StillAsserted,

    #[error("E-stop not asserted")]
    NotAsserted,

    #[error("release locked out for {remaining_s:.0} s")]
    LockedOut { remaining_s: f64 },
}

#[derive(Debug)]
pub struct EStopMonitor {
    enabled: bool,
    asserted: bool,
    failed_attempts: u32,
    max_failed_attempts: u32,
    lockout_until_ns: Option<u64>,
    lockout_duration_ns: u64,
}

impl EStopMonitor {
    pub fn from_settings(settings: &SafetySettings) -> Self {
        Self {
            enabled: settings.emergency_stop_enabled,
            asserted: false,
            failed_attempts: 0,
            max_failed_attempts: settings.max_failed_attempts,
            lockout_until_ns: None,
            lockout_duration_ns: secs_to_ns(settings.lockout_duration_minutes * 60.0),
        }
    }

    #[inline]
    pub const fn is_asserted(&self) -> bool {
        self.asserted
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Latch an assertion observed by the reflex sampler thread.
    /// Returns true exactly once per assertion edge.
    pub fn force_asserted(&mut self) -> bool {
        if self.enabled && !self.asserted {
            self.asserted = true;
            error!("emergency stop asserted");
            return true;
        }
        false
    }

    /// Feed one sampled input level. Returns true exactly once per
    /// assertion edge; the caller then executes the emergency sequence.
    pub fn sample(&mut self, input_active: bool) -> bool {
        if !self.enabled {
            return false;
        }
        if input_active && !self.asserted {
            self.asserted = true;
            error!("emergency stop asserted");
            return true;
        }
        false
    }

    /// Operator release + acknowledge. The input must be clear; too many
    /// failed attempts lock the release path out.
    pub fn release(&mut self, input_active: bool, now_ns: u64) -> Result<(), ReleaseError> {
        if !self.asserted {
            return Err(ReleaseError::NotAsserted);
        }
        if let Some(until) = self.lockout_until_ns {
            if now_ns < until {
                return Err(ReleaseError::LockedOut {
                    remaining_s: (until - now_ns) as f64 / 1e9,
                });
            }
            self.lockout_until_ns = None;
            self.failed_attempts = 0;
        }
        if input_active {
            self.failed_attempts += 1;
            warn!(
                attempts = self.failed_attempts,
                "E-stop release refused: input still asserted"
            );
            if self.failed_attempts >= self.max_failed_attempts {
                self.lockout_until_ns = Some(now_ns + self.lockout_duration_ns);
                warn!("E-stop release locked out");
            }
            return Err(ReleaseError::StillAsserted);
        }
        self.asserted = false;
        self.failed_attempts = 0;
        info!("emergency stop released");
        Ok(())
    }
}
