//! Global system state enum.
//!
//! `#[repr(u8)]` for compact transport to status consumers. The transition
//! table and its guards live in `sorter_control::machine`; this module only
//! defines the states and their coarse behavioral predicates.

use serde::{Deserialize, Serialize};

/// Global system lifecycle state.
///
/// Only one state is active at any time; transitions go through the single
/// writer in the control crate. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SystemState {
    /// Components are being constructed and validated.
    Initializing = 0,
    /// Ready, belt stopped, no items accepted.
    Idle = 1,
    /// Belt running, items flowing trigger → classify → fire.
    Running = 2,
    /// Belt stopped on operator or watchdog request; imminent fires may complete.
    Paused = 3,
    /// Operator service window; auto-times-out back to idle.
    Maintenance = 4,
    /// Fault latched; new work refused, status APIs keep serving.
    Error = 5,
    /// Recovery strategy in progress.
    Recovering = 6,
    /// Pipeline draining with a deadline.
    ShuttingDown = 7,
    /// Terminal.
    Shutdown = 8,
}

impl SystemState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initializing),
            1 => Some(Self::Idle),
            2 => Some(Self::Running),
            3 => Some(Self::Paused),
            4 => Some(Self::Maintenance),
            5 => Some(Self::Error),
            6 => Some(Self::Recovering),
            7 => Some(Self::ShuttingDown),
            8 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
            Self::Recovering => "recovering",
            Self::ShuttingDown => "shutting_down",
            Self::Shutdown => "shutdown",
        }
    }

    /// New fires may only be scheduled while running.
    #[inline]
    pub const fn accepts_new_items(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether already-scheduled imminent fires may still complete.
    /// Emergency handling (`Error` via E-stop) cancels them instead.
    #[inline]
    pub const fn allows_imminent_fires(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Maintenance)
    }

    /// Terminal state; no transitions out.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
