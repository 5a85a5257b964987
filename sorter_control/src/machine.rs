//! System state machine: legal transitions, guards, forced pre-emption.
//!
//! The machine is the single writer of `SystemState`. Ordinary requests
//! come from the control API; the safety supervisor publishes
//! `ForcedTransition` intents on a priority channel that the orchestrator
//! drains before anything else, which resolves the cyclic coupling
//! between safety and state without a second writer.

use tracing::info;

use sorter_common::state::SystemState;

/// An accepted transition, published as `StateChanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: SystemState,
    pub to: SystemState,
    pub reason: String,
}

/// Why a transition request was rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} → {to}")]
    Illegal { from: SystemState, to: SystemState },

    #[error("guard failed: {0}")]
    GuardFailed(&'static str),
}

/// Safety pre-emption intent, drained before ordinary requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedTransition {
    pub target: SystemState,
    pub reason: String,
}

/// Guard inputs sampled by the orchestrator at request time.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardContext {
    pub belt_running: bool,
    pub components_healthy: bool,
    pub estop_asserted: bool,
}

/// Single-writer state machine.
#[derive(Debug)]
pub struct SorterStateMachine {
    state: SystemState,
    entered_ts_ns: u64,
    last_reason: String,
    maintenance_timeout_ns: u64,
}

impl SorterStateMachine {
    pub fn new(maintenance_timeout_ns: u64) -> Self {
        Self {
            state: SystemState::Initializing,
            entered_ts_ns: 0,
            last_reason: String::new(),
            maintenance_timeout_ns,
        }
    }

    #[inline]
    pub const fn state(&self) -> SystemState {
        self.state
    }

    #[inline]
    pub const fn entered_ts_ns(&self) -> u64 {
        self.entered_ts_ns
    }

    pub fn last_reason(&self) -> &str {
        &self.last_reason
    }

    /// Static legality of an edge, before guards.
    pub fn transition_allowed(from: SystemState, to: SystemState) -> bool {
        use SystemState::*;
        matches!(
            (from, to),
            (Initializing, Idle | Error)
                | (Idle, Running | Maintenance | ShuttingDown | Error)
                | (Running, Paused | Maintenance | Error | Recovering | ShuttingDown)
                | (Paused, Running | Maintenance | Error | ShuttingDown)
                | (Maintenance, Idle | ShuttingDown)
                | (Error, Recovering | ShuttingDown)
                | (Recovering, Idle | Running | Error | ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }

    /// Attempt a guarded transition.
    pub fn request(
        &mut self,
        to: SystemState,
        reason: impl Into<String>,
        ctx: &GuardContext,
        now_ns: u64,
    ) -> Result<StateChange, TransitionError> {
        let from = self.state;
        if !Self::transition_allowed(from, to) {
            return Err(TransitionError::Illegal { from, to });
        }

        match to {
            SystemState::Running => {
                if ctx.estop_asserted {
                    return Err(TransitionError::GuardFailed("E-stop asserted"));
                }
                if !ctx.components_healthy {
                    return Err(TransitionError::GuardFailed("critical component unhealthy"));
                }
                if !ctx.belt_running {
                    return Err(TransitionError::GuardFailed("belt not running"));
                }
            }
            SystemState::Maintenance => {
                if !matches!(from, SystemState::Idle | SystemState::Paused) {
                    return Err(TransitionError::GuardFailed(
                        "maintenance entered only from idle or paused",
                    ));
                }
            }
            _ => {}
        }

        Ok(self.apply(to, reason.into(), now_ns))
    }

    /// Apply a safety-forced transition, bypassing guards.
    ///
    /// Forcing `Error` (safety precedence) or `ShuttingDown` (stop is
    /// legal from anywhere) is accepted from any non-terminal state;
    /// other targets still require a legal edge. Returns `None` when the
    /// machine is already in the target state or the edge is dead.
    pub fn force(
        &mut self,
        target: SystemState,
        reason: impl Into<String>,
        now_ns: u64,
    ) -> Option<StateChange> {
        let from = self.state;
        if from == target || from.is_terminal() {
            return None;
        }
        let always_reachable =
            matches!(target, SystemState::Error | SystemState::ShuttingDown);
        if !always_reachable && !Self::transition_allowed(from, target) {
            return None;
        }
        Some(self.apply(target, reason.into(), now_ns))
    }

    /// Periodic housekeeping: maintenance auto-timeout back to idle.
    pub fn tick(&mut self, now_ns: u64) -> Option<StateChange> {
        if self.state == SystemState::Maintenance
            && now_ns.saturating_sub(self.entered_ts_ns) >= self.maintenance_timeout_ns
        {
            return Some(self.apply(
                SystemState::Idle,
                "maintenance window timed out".into(),
                now_ns,
            ));
        }
        None
    }

    fn apply(&mut self, to: SystemState, reason: String, now_ns: u64) -> StateChange {
        let from = self.state;
        self.state = to;
        self.entered_ts_ns = now_ns;
        self.last_reason = reason.clone();
        info!(%from, %to, %reason, "state transition");
        StateChange { from, to, reason }
    }
}
