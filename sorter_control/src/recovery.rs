//! Recovery supervisor: fault strategies, budgets, escalation.
//!
//! The only retry authority in the system. Components report faults and
//! never retry on their own; this supervisor maps each fault kind to a
//! strategy, enforces per-record cooldowns and consecutive-failure
//! budgets, and carries a global restart budget across all kinds;
//! once exhausted, it escalates and stays escalated until an operator
//! reset, regardless of kind.

use std::collections::{HashMap, VecDeque};

use tracing::{info, warn};

use sorter_common::clock::secs_to_ns;
use sorter_common::config::SorterConfig;
use sorter_common::fault::{Fault, FaultKind, FaultReport};
use sorter_common::item::Category;

/// Where a failover lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverTarget {
    BackupCamera(u32),
    BackupModel,
}

/// What the orchestrator should do about a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the same component after its cooldown.
    Retry { component: String },
    /// Restart a heavy component.
    RestartComponent { component: String },
    /// Switch to a backup resource.
    Failover {
        component: String,
        target: FailoverTarget,
    },
    /// Mark a sensor degraded and exclude it from decisions.
    DegradeSensor { component: String },
    /// Disable one diverter; the rest of the pipeline keeps running.
    DisableDiverter { category: Category },
    /// Close one category (bin full); operator intervention required.
    PauseCategory { category: Category },
    /// Stop the belt and go to error.
    StopBelt,
    /// Force a pause (resource pressure, temperature).
    Pause { reason: String },
    /// State → error; no further automatic action.
    Escalate { reason: String },
    /// No automatic recovery for this kind.
    None,
}

impl RecoveryAction {
    /// Actions that consume the global restart budget.
    const fn consumes_budget(&self) -> bool {
        matches!(
            self,
            Self::Retry { .. } | Self::RestartComponent { .. } | Self::Failover { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub error_recovery_enabled: bool,
    pub max_consecutive_failures: u32,
    /// Cooldown between recoveries of one record; the consecutive count
    /// also resets once `2 ×` this passes without a repeat.
    pub failure_recovery_delay_ns: u64,
    pub auto_disable_on_fault: bool,
    /// Global budget across all kinds within the restart window.
    pub max_restart_attempts: u32,
    pub restart_window_ns: u64,
    pub backup_cameras: Vec<u32>,
    pub has_backup_model: bool,
}

impl RecoveryPolicy {
    pub fn from_config(config: &SorterConfig) -> Self {
        let tolerance = &config
            .diverter_control_settings
            .global_settings
            .fault_tolerance;
        let system = &config.system_settings;
        Self {
            error_recovery_enabled: system.error_recovery_enabled,
            max_consecutive_failures: tolerance.max_consecutive_failures,
            failure_recovery_delay_ns: secs_to_ns(tolerance.failure_recovery_delay_s),
            auto_disable_on_fault: tolerance.auto_disable_on_fault,
            max_restart_attempts: system.max_restart_attempts,
            restart_window_ns: secs_to_ns(
                system.restart_delay_s * system.max_restart_attempts.max(1) as f64,
            ),
            backup_cameras: config.camera_settings.backup_cameras.clone(),
            has_backup_model: config.ai_model_settings.backup_model_path.is_some(),
        }
    }
}

#[derive(Debug)]
struct FaultRecord {
    fault: Fault,
    consecutive: u32,
}

pub struct RecoverySupervisor {
    policy: RecoveryPolicy,
    records: HashMap<(FaultKind, String), FaultRecord>,
    /// Timestamps of budget-consuming recovery attempts.
    attempts: VecDeque<u64>,
    escalated: bool,
}

impl RecoverySupervisor {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            attempts: VecDeque::new(),
            escalated: false,
        }
    }

    pub fn update_policy(&mut self, policy: RecoveryPolicy) {
        self.policy = policy;
    }

    #[inline]
    pub const fn is_escalated(&self) -> bool {
        self.escalated
    }

    /// Operator reset after the error was resolved by hand.
    pub fn reset(&mut self) {
        self.escalated = false;
        self.attempts.clear();
        self.records.clear();
    }

    /// Coalesced fault records, for status reporting.
    pub fn faults(&self) -> Vec<Fault> {
        self.records.values().map(|r| r.fault.clone()).collect()
    }

    /// Decide the recovery strategy for one fault occurrence.
    pub fn on_fault(&mut self, report: &FaultReport, now_ns: u64) -> RecoveryAction {
        let record = self.record_for(report, now_ns);
        let consecutive = record.consecutive;

        if self.escalated {
            return RecoveryAction::Escalate {
                reason: "recovery budget exhausted".into(),
            };
        }
        if !self.policy.error_recovery_enabled {
            self.escalated = true;
            return RecoveryAction::Escalate {
                reason: "automatic recovery disabled".into(),
            };
        }

        let action = self.strategy_for(report, consecutive);

        if action.consumes_budget() && !self.budget_allows(now_ns) {
            self.escalated = true;
            warn!(
                kind = %report.kind,
                component = %report.component,
                "global restart budget exhausted"
            );
            return RecoveryAction::Escalate {
                reason: "max restart attempts exhausted".into(),
            };
        }
        if matches!(action, RecoveryAction::Escalate { .. }) {
            self.escalated = true;
        }
        if action.consumes_budget() {
            if let Some(record) = self
                .records
                .get_mut(&(report.kind, report.component.clone()))
            {
                record.fault.last_recovery_ts_ns = Some(now_ns);
            }
        }
        info!(kind = %report.kind, component = %report.component, ?action, "recovery decision");
        action
    }

    /// A strategy run succeeded: reset the record's consecutive count.
    pub fn on_recovery_success(&mut self, kind: FaultKind, component: &str, now_ns: u64) {
        if let Some(record) = self.records.get_mut(&(kind, component.to_string())) {
            record.consecutive = 0;
            record.fault.last_recovery_ts_ns = Some(now_ns);
        }
        info!(%kind, component, "recovery succeeded");
    }

    fn record_for(&mut self, report: &FaultReport, now_ns: u64) -> &FaultRecord {
        let key = (report.kind, report.component.clone());
        let reset_window = self.policy.failure_recovery_delay_ns.saturating_mul(2);
        let record = self
            .records
            .entry(key)
            .and_modify(|record| {
                // A long quiet period ends the consecutive streak.
                if now_ns.saturating_sub(record.fault.last_ts_ns) > reset_window {
                    record.consecutive = 0;
                }
                record.fault.coalesce(report);
                record.consecutive += 1;
            })
            .or_insert_with(|| FaultRecord {
                fault: Fault::from_report(report),
                consecutive: 1,
            });
        record
    }

    fn strategy_for(&self, report: &FaultReport, consecutive: u32) -> RecoveryAction {
        let max = self.policy.max_consecutive_failures;
        let component = report.component.clone();
        match report.kind {
            FaultKind::EStop => RecoveryAction::None,
            FaultKind::ConfigInvalid => RecoveryAction::None,
            FaultKind::BinFull => match report.category {
                Some(category) => RecoveryAction::PauseCategory { category },
                None => RecoveryAction::None,
            },
            FaultKind::BeltFailure => RecoveryAction::StopBelt,
            FaultKind::HighTemperature => RecoveryAction::Pause {
                reason: "temperature above threshold".into(),
            },
            FaultKind::MemoryLeak => {
                if consecutive == 1 {
                    RecoveryAction::RestartComponent {
                        component: "pipeline".into(),
                    }
                } else {
                    RecoveryAction::Pause {
                        reason: "memory pressure persists".into(),
                    }
                }
            }
            FaultKind::CameraFailure => {
                if consecutive == 1 {
                    if let Some(backup) = self.policy.backup_cameras.first() {
                        return RecoveryAction::Failover {
                            component,
                            target: FailoverTarget::BackupCamera(*backup),
                        };
                    }
                    RecoveryAction::Retry { component }
                } else if consecutive <= max {
                    RecoveryAction::Retry { component }
                } else {
                    RecoveryAction::Escalate {
                        reason: "camera unrecoverable".into(),
                    }
                }
            }
            FaultKind::AiModelFailure => {
                if consecutive == 1 {
                    // Reload the primary model first.
                    RecoveryAction::Retry { component }
                } else if consecutive == 2 && self.policy.has_backup_model {
                    RecoveryAction::Failover {
                        component,
                        target: FailoverTarget::BackupModel,
                    }
                } else if consecutive <= max {
                    RecoveryAction::Retry { component }
                } else {
                    RecoveryAction::Escalate {
                        reason: "classifier unrecoverable".into(),
                    }
                }
            }
            FaultKind::HardwareFailure => {
                if consecutive <= max {
                    RecoveryAction::Retry { component }
                } else if self.policy.auto_disable_on_fault {
                    match report.category {
                        Some(category) => RecoveryAction::DisableDiverter { category },
                        None => RecoveryAction::Escalate {
                            reason: "hardware fault outside a diverter".into(),
                        },
                    }
                } else {
                    RecoveryAction::Escalate {
                        reason: "hardware fault persists".into(),
                    }
                }
            }
            FaultKind::SensorFailure => {
                if consecutive == 1 {
                    RecoveryAction::DegradeSensor { component }
                } else if consecutive <= max {
                    RecoveryAction::Retry { component }
                } else {
                    RecoveryAction::Escalate {
                        reason: "sensor unrecoverable".into(),
                    }
                }
            }
        }
    }

    fn budget_allows(&mut self, now_ns: u64) -> bool {
        let horizon = now_ns.saturating_sub(self.policy.restart_window_ns);
        while self.attempts.front().is_some_and(|ts| *ts < horizon) {
            self.attempts.pop_front();
        }
        if self.attempts.len() as u32 >= self.policy.max_restart_attempts {
            return false;
        }
        self.attempts.push_back(now_ns);
        true
    }
}
