//! Operational-limits watchdog with hysteresis.
//!
//! Samples host resources and pipeline throughput against the configured
//! thresholds. Warning crossings pause the system; critical crossings
//! escalate to error. A tripped limit clears only after the value stays
//! below `threshold − margin` for N consecutive samples, so a reading
//! hovering at the threshold cannot flap the state machine.

use std::fs;

use tracing::{debug, warn};

use sorter_common::config::{AlertThresholds, OperationalLimits};

use crate::metrics::SystemSample;

/// Watched quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitKind {
    Cpu,
    Memory,
    Temperature,
    Runtime,
    Throughput,
}

const LIMIT_KINDS: [LimitKind; 5] = [
    LimitKind::Cpu,
    LimitKind::Memory,
    LimitKind::Temperature,
    LimitKind::Runtime,
    LimitKind::Throughput,
];

impl LimitKind {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu_overload",
            Self::Memory => "memory_leak",
            Self::Temperature => "high_temperature",
            Self::Runtime => "runtime_limit",
            Self::Throughput => "throughput_limit",
        }
    }
}

/// Watchdog verdicts for one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitAction {
    /// Warning threshold crossed: force pause, raise a warning alert.
    Pause { kind: &'static str, message: String },
    /// Critical threshold crossed: force error.
    Escalate { kind: &'static str, message: String },
    /// Hysteresis cleared: the limit released.
    Clear { kind: &'static str },
}

#[derive(Debug, Clone, Copy, Default)]
struct Latch {
    tripped: bool,
    escalated: bool,
    below_count: u32,
}

pub struct LimitsWatchdog {
    alerts: AlertThresholds,
    limits: OperationalLimits,
    latches: [Latch; LIMIT_KINDS.len()],
}

impl LimitsWatchdog {
    pub fn new(alerts: AlertThresholds, limits: OperationalLimits) -> Self {
        Self {
            alerts,
            limits,
            latches: [Latch::default(); LIMIT_KINDS.len()],
        }
    }

    pub fn update_settings(&mut self, alerts: AlertThresholds, limits: OperationalLimits) {
        self.alerts = alerts;
        self.limits = limits;
    }

    /// Evaluate one sample set. `runtime_h` is continuous runtime since
    /// the last start; `items_last_hour` is pipeline throughput.
    pub fn evaluate(
        &mut self,
        sample: &SystemSample,
        runtime_h: f64,
        items_last_hour: u64,
    ) -> Vec<LimitAction> {
        let mut actions = Vec::new();
        for (idx, kind) in LIMIT_KINDS.iter().enumerate() {
            let (value, warn_at, critical_at) = match kind {
                LimitKind::Cpu => (
                    sample.cpu_pct as f64,
                    self.alerts.cpu_warning_percent as f64,
                    Some(self.alerts.cpu_critical_percent as f64),
                ),
                LimitKind::Memory => (
                    sample.mem_pct as f64,
                    self.alerts.memory_warning_percent as f64,
                    Some(self.alerts.memory_critical_percent as f64),
                ),
                LimitKind::Temperature => (
                    sample.temp_c as f64,
                    self.alerts.temperature_warning_celsius as f64,
                    Some(self.limits.max_temperature_celsius as f64),
                ),
                // Hard operational limits pause; no critical tier.
                LimitKind::Runtime => (
                    runtime_h,
                    self.limits.max_continuous_runtime_hours,
                    None,
                ),
                LimitKind::Throughput => (
                    items_last_hour as f64,
                    self.limits.max_objects_per_hour as f64,
                    None,
                ),
            };
            if let Some(action) = self.evaluate_one(idx, *kind, value, warn_at, critical_at) {
                actions.push(action);
            }
        }
        actions
    }

    fn evaluate_one(
        &mut self,
        idx: usize,
        kind: LimitKind,
        value: f64,
        warn_at: f64,
        critical_at: Option<f64>,
    ) -> Option<LimitAction> {
        let margin = self.alerts.hysteresis_margin_percent as f64;
        let latch = &mut self.latches[idx];

        if let Some(critical) = critical_at {
            if value >= critical && !latch.escalated {
                latch.tripped = true;
                latch.escalated = true;
                latch.below_count = 0;
                warn!(kind = kind.as_str(), value, critical, "critical limit crossed");
                return Some(LimitAction::Escalate {
                    kind: kind.as_str(),
                    message: format!("{} at {value:.1} (critical {critical:.1})", kind.as_str()),
                });
            }
        }

        if value >= warn_at {
            latch.below_count = 0;
            if !latch.tripped {
                latch.tripped = true;
                warn!(kind = kind.as_str(), value, warn_at, "limit crossed");
                return Some(LimitAction::Pause {
                    kind: kind.as_str(),
                    message: format!("{} at {value:.1} (limit {warn_at:.1})", kind.as_str()),
                });
            }
            return None;
        }

        if latch.tripped {
            if value < warn_at - margin {
                latch.below_count += 1;
                if latch.below_count >= self.alerts.clear_samples {
                    *latch = Latch::default();
                    debug!(kind = kind.as_str(), "limit cleared");
                    return Some(LimitAction::Clear {
                        kind: kind.as_str(),
                    });
                }
            } else {
                // Inside the hysteresis band: hold the latch.
                latch.below_count = 0;
            }
        }
        None
    }
}

// ─── System Sampling ────────────────────────────────────────────────

/// Host resource sampling seam so tests inject readings.
pub trait SystemSampler: Send {
    fn sample(&mut self) -> SystemSample;
}

/// Best-effort Linux sampler over procfs/sysfs. Missing files read as
/// zero so off-target runs keep working.
pub struct ProcSampler {
    prev_cpu: Option<(u64, u64)>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self { prev_cpu: None }
    }

    fn cpu_pct(&mut self) -> f32 {
        let Ok(stat) = fs::read_to_string("/proc/stat") else {
            return 0.0;
        };
        let Some(line) = stat.lines().next() else {
            return 0.0;
        };
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 4 {
            return 0.0;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        let busy = total - idle;
        let pct = match self.prev_cpu {
            Some((prev_busy, prev_total)) if total > prev_total => {
                (busy - prev_busy) as f32 / (total - prev_total) as f32 * 100.0
            }
            _ => 0.0,
        };
        self.prev_cpu = Some((busy, total));
        pct
    }

    fn mem_pct() -> f32 {
        let Ok(meminfo) = fs::read_to_string("/proc/meminfo") else {
            return 0.0;
        };
        let read_kb = |key: &str| -> Option<u64> {
            meminfo
                .lines()
                .find(|l| l.starts_with(key))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        match (read_kb("MemTotal:"), read_kb("MemAvailable:")) {
            (Some(total), Some(available)) if total > 0 => {
                (total - available) as f32 / total as f32 * 100.0
            }
            _ => 0.0,
        }
    }

    fn temp_c() -> f32 {
        fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")
            .ok()
            .and_then(|raw| raw.trim().parse::<f32>().ok())
            .map(|milli| milli / 1000.0)
            .unwrap_or(0.0)
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for ProcSampler {
    fn sample(&mut self) -> SystemSample {
        SystemSample {
            cpu_pct: self.cpu_pct(),
            mem_pct: Self::mem_pct(),
            temp_c: Self::temp_c(),
        }
    }
}
