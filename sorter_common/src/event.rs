//! Telemetry event shapes and topics.
//!
//! Events fan out on the in-process bus to the database writer, the
//! WebSocket broadcaster, and test observers. Publication is non-blocking;
//! each subscriber owns a bounded buffer with its own drop policy.

use serde::{Deserialize, Serialize};

use crate::fault::Severity;
use crate::item::{BoundingBox, Category, DropReason, ItemId, CATEGORY_COUNT};
use crate::state::SystemState;

/// Bin fill state against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BinState {
    Ok = 0,
    Warn = 1,
    Full = 2,
    Critical = 3,
}

impl BinState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Full => "full",
            Self::Critical => "critical",
        }
    }

    /// Bins at or above `Full` refuse new items.
    #[inline]
    pub const fn accepts_items(&self) -> bool {
        matches!(self, Self::Ok | Self::Warn)
    }
}

impl Default for BinState {
    fn default() -> Self {
        Self::Ok
    }
}

/// Periodic metrics sample, ring-buffered by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Wall-clock timestamp [ms since the UNIX epoch].
    pub wall_ts_ms: u64,
    pub items_processed: u64,
    pub items_per_minute: f64,
    pub avg_confidence: f64,
    /// Errors per processed item over the lifetime of the run, `0..=1`.
    pub error_rate: f64,
    /// Actuated item counts, indexed by `Category::idx()`.
    pub per_category_counts: [u64; CATEGORY_COUNT],
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub temp_c: f32,
}

/// Everything published on the telemetry bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    ItemActuated {
        item_id: ItemId,
        trigger_ts_ns: u64,
        classify_ts_ns: u64,
        fire_ts_ns: u64,
        category: Category,
        confidence: f64,
        bbox: Option<BoundingBox>,
        diverter_op_count: u64,
    },
    ItemDropped {
        item_id: ItemId,
        trigger_ts_ns: u64,
        category: Option<Category>,
        reason: DropReason,
    },
    StateChanged {
        from: SystemState,
        to: SystemState,
        reason: String,
    },
    Alert {
        severity: Severity,
        /// Fault kind name or watchdog limit name, e.g. `"e_stop"`,
        /// `"cpu_overload"`.
        kind: String,
        component: String,
        message: String,
    },
    Metrics(MetricsSnapshot),
    BinChanged {
        category: Category,
        fill_fraction: f64,
        state: BinState,
    },
}

/// Named topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ItemActuated,
    ItemDropped,
    Metrics,
    StateChanged,
    Alert,
    BinChanged,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::ItemActuated,
        Topic::ItemDropped,
        Topic::Metrics,
        Topic::StateChanged,
        Topic::Alert,
        Topic::BinChanged,
    ];

    /// Topic an event is published on.
    pub const fn of(event: &TelemetryEvent) -> Topic {
        match event {
            TelemetryEvent::ItemActuated { .. } => Topic::ItemActuated,
            TelemetryEvent::ItemDropped { .. } => Topic::ItemDropped,
            TelemetryEvent::StateChanged { .. } => Topic::StateChanged,
            TelemetryEvent::Alert { .. } => Topic::Alert,
            TelemetryEvent::Metrics(_) => Topic::Metrics,
            TelemetryEvent::BinChanged { .. } => Topic::BinChanged,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ItemActuated => "item.actuated",
            Self::ItemDropped => "item.dropped",
            Self::Metrics => "metrics",
            Self::StateChanged => "state.changed",
            Self::Alert => "alert",
            Self::BinChanged => "bin.changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_state_gate() {
        assert!(BinState::Ok.accepts_items());
        assert!(BinState::Warn.accepts_items());
        assert!(!BinState::Full.accepts_items());
        assert!(!BinState::Critical.accepts_items());
    }

    #[test]
    fn topic_of_each_event() {
        let dropped = TelemetryEvent::ItemDropped {
            item_id: 1,
            trigger_ts_ns: 0,
            category: None,
            reason: DropReason::Late,
        };
        assert_eq!(Topic::of(&dropped), Topic::ItemDropped);

        let state = TelemetryEvent::StateChanged {
            from: SystemState::Idle,
            to: SystemState::Running,
            reason: "start".into(),
        };
        assert_eq!(Topic::of(&state), Topic::StateChanged);
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::ItemActuated.as_str(), "item.actuated");
        assert_eq!(Topic::BinChanged.as_str(), "bin.changed");
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = TelemetryEvent::BinChanged {
            category: Category::Glass,
            fill_fraction: 0.96,
            state: BinState::Critical,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"bin_changed\""), "got: {json}");
        assert!(json.contains("\"glass\""), "got: {json}");
    }
}
