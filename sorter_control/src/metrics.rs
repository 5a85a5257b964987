//! Metrics counters and ring-buffered snapshots.
//!
//! O(1) recording on the hot path; snapshots are produced on the metrics
//! tick and kept in a fixed-size history buffer, never reallocated.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use heapless::HistoryBuffer;

use sorter_common::clock::NANOS_PER_SEC;
use sorter_common::event::MetricsSnapshot;
use sorter_common::item::{Category, DropReason, CATEGORY_COUNT, DROP_REASON_COUNT};

/// Bounded snapshot history (ring).
pub const METRICS_HISTORY: usize = 256;

/// Host resource reading attached to snapshots and watched by the
/// limits watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub temp_c: f32,
}

/// Wall-clock now [ms since the UNIX epoch].
pub fn wall_ts_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct MetricsCollector {
    history: HistoryBuffer<MetricsSnapshot, METRICS_HISTORY>,
    items_processed: u64,
    actuated_per_category: [u64; CATEGORY_COUNT],
    drops_per_reason: [u64; DROP_REASON_COUNT],
    confidence_sum: f64,
    confidence_count: u64,
    errors: u64,
    /// Monotonic timestamps of recently processed items, pruned to the
    /// trailing hour (drives the objects-per-hour limit).
    recent_ns: VecDeque<u64>,
    /// (now_ns, items_processed) at the previous snapshot.
    prev_snapshot: Option<(u64, u64)>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: HistoryBuffer::new(),
            items_processed: 0,
            actuated_per_category: [0; CATEGORY_COUNT],
            drops_per_reason: [0; DROP_REASON_COUNT],
            confidence_sum: 0.0,
            confidence_count: 0,
            errors: 0,
            recent_ns: VecDeque::new(),
            prev_snapshot: None,
        }
    }

    pub fn record_actuated(&mut self, category: Category, confidence: f64, now_ns: u64) {
        self.items_processed += 1;
        self.actuated_per_category[category.idx()] += 1;
        self.confidence_sum += confidence;
        self.confidence_count += 1;
        self.push_recent(now_ns);
    }

    pub fn record_dropped(&mut self, reason: DropReason, now_ns: u64) {
        self.items_processed += 1;
        self.drops_per_reason[reason.idx()] += 1;
        self.push_recent(now_ns);
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    fn push_recent(&mut self, now_ns: u64) {
        self.recent_ns.push_back(now_ns);
        self.prune(now_ns);
    }

    fn prune(&mut self, now_ns: u64) {
        let horizon = now_ns.saturating_sub(3600 * NANOS_PER_SEC);
        while self.recent_ns.front().is_some_and(|ts| *ts < horizon) {
            self.recent_ns.pop_front();
        }
    }

    /// Items processed in the trailing hour.
    pub fn items_in_last_hour(&mut self, now_ns: u64) -> u64 {
        self.prune(now_ns);
        self.recent_ns.len() as u64
    }

    #[inline]
    pub const fn items_processed(&self) -> u64 {
        self.items_processed
    }

    #[inline]
    pub const fn errors(&self) -> u64 {
        self.errors
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops_per_reason[reason.idx()]
    }

    pub fn actuated(&self, category: Category) -> u64 {
        self.actuated_per_category[category.idx()]
    }

    /// Produce one snapshot and append it to the ring.
    pub fn snapshot(
        &mut self,
        now_ns: u64,
        wall_ts_ms: u64,
        sys: SystemSample,
    ) -> MetricsSnapshot {
        let items_per_minute = match self.prev_snapshot {
            Some((prev_ns, prev_items)) if now_ns > prev_ns => {
                let minutes = (now_ns - prev_ns) as f64 / (60.0 * NANOS_PER_SEC as f64);
                (self.items_processed - prev_items) as f64 / minutes
            }
            _ => 0.0,
        };
        self.prev_snapshot = Some((now_ns, self.items_processed));

        let snapshot = MetricsSnapshot {
            wall_ts_ms,
            items_processed: self.items_processed,
            items_per_minute,
            avg_confidence: if self.confidence_count == 0 {
                0.0
            } else {
                self.confidence_sum / self.confidence_count as f64
            },
            error_rate: if self.items_processed == 0 {
                0.0
            } else {
                self.errors as f64 / self.items_processed as f64
            },
            per_category_counts: self.actuated_per_category,
            cpu_pct: sys.cpu_pct,
            mem_pct: sys.mem_pct,
            temp_c: sys.temp_c,
        };
        self.history.write(snapshot);
        snapshot
    }

    /// The most recent `n` snapshots, oldest first.
    pub fn window(&self, n: usize) -> Vec<MetricsSnapshot> {
        let len = self.history.len();
        self.history
            .oldest_ordered()
            .skip(len.saturating_sub(n))
            .copied()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
