//! Fault taxonomy consumed by the recovery supervisor.
//!
//! Local components report faults and never retry on their own; the
//! recovery supervisor is the only retry authority, which keeps the retry
//! budget enforceable globally. Faults for the same (kind, component) pair
//! coalesce into one record while the record's cooldown is active.

use serde::{Deserialize, Serialize};

/// Closed fault taxonomy. Extensible only by code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FaultKind {
    /// Capture timeout or camera driver error.
    CameraFailure = 0,
    /// Classifier error or model init failure.
    AiModelFailure = 1,
    /// GPIO write error or actuator fault.
    HardwareFailure = 2,
    /// Echo timeout or implausible sensor reading.
    SensorFailure = 3,
    /// PWM error or implausible belt speed.
    BeltFailure = 4,
    /// Bin fill at or above the critical threshold.
    BinFull = 5,
    /// Memory usage above threshold, sustained.
    MemoryLeak = 6,
    /// Temperature above threshold.
    HighTemperature = 7,
    /// Emergency-stop input asserted.
    EStop = 8,
    /// Rejected configuration reload.
    ConfigInvalid = 9,
}

impl FaultKind {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::CameraFailure),
            1 => Some(Self::AiModelFailure),
            2 => Some(Self::HardwareFailure),
            3 => Some(Self::SensorFailure),
            4 => Some(Self::BeltFailure),
            5 => Some(Self::BinFull),
            6 => Some(Self::MemoryLeak),
            7 => Some(Self::HighTemperature),
            8 => Some(Self::EStop),
            9 => Some(Self::ConfigInvalid),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CameraFailure => "camera_failure",
            Self::AiModelFailure => "ai_model_failure",
            Self::HardwareFailure => "hardware_failure",
            Self::SensorFailure => "sensor_failure",
            Self::BeltFailure => "belt_failure",
            Self::BinFull => "bin_full",
            Self::MemoryLeak => "memory_leak",
            Self::HighTemperature => "high_temperature",
            Self::EStop => "e_stop",
            Self::ConfigInvalid => "config_invalid",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warn = 1,
    Error = 2,
    Critical = 3,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// A single fault occurrence as reported by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    /// Reporting component, e.g. `"camera"`, `"belt"`, `"diverter:metal"`.
    pub component: String,
    pub severity: Severity,
    /// Monotonic timestamp of the occurrence [ns].
    pub ts_ns: u64,
    pub detail: String,
    /// Category the fault concerns, for diverter and bin faults.
    pub category: Option<crate::item::Category>,
}

impl FaultReport {
    pub fn new(
        kind: FaultKind,
        component: impl Into<String>,
        severity: Severity,
        ts_ns: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            severity,
            ts_ns,
            detail: detail.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: crate::item::Category) -> Self {
        self.category = Some(category);
        self
    }
}

/// Coalesced per-(kind, component) fault record kept by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub component: String,
    pub severity: Severity,
    pub first_ts_ns: u64,
    pub last_ts_ns: u64,
    /// Occurrences coalesced into this record.
    pub count: u64,
    pub last_recovery_ts_ns: Option<u64>,
}

impl Fault {
    /// First occurrence of a (kind, component) pair.
    pub fn from_report(report: &FaultReport) -> Self {
        Self {
            kind: report.kind,
            component: report.component.clone(),
            severity: report.severity,
            first_ts_ns: report.ts_ns,
            last_ts_ns: report.ts_ns,
            count: 1,
            last_recovery_ts_ns: None,
        }
    }

    /// Fold a repeat occurrence into the record. Severity never decreases.
    pub fn coalesce(&mut self, report: &FaultReport) {
        self.last_ts_ns = report.ts_ns;
        self.count += 1;
        if report.severity > self.severity {
            self.severity = report.severity;
        }
    }
}
