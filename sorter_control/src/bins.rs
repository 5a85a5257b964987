//! Bin-fill monitor with hysteresis.
//!
//! Translates smoothed fill fractions into per-category bin states
//! against the configured thresholds. A bin that reached `Full` (or
//! `Critical`) only re-opens once the fill drops below `warn − 5` so a
//! level hovering at the threshold cannot flap the category gate.

use tracing::info;

use sorter_common::config::BinLevelSettings;
use sorter_common::event::BinState;
use sorter_common::item::{Category, CATEGORY_COUNT};

/// Exit hysteresis below the warn threshold [percent points].
const FULL_EXIT_MARGIN_PCT: f64 = 5.0;

/// One observed bin state change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinTransition {
    pub category: Category,
    pub from: BinState,
    pub to: BinState,
    pub fill_fraction: f64,
}

#[derive(Debug, Clone, Copy)]
struct BinRecord {
    state: BinState,
    fill_fraction: f64,
    last_measurement_ns: u64,
}

impl Default for BinRecord {
    fn default() -> Self {
        Self {
            state: BinState::Ok,
            fill_fraction: 0.0,
            last_measurement_ns: 0,
        }
    }
}

pub struct BinMonitor {
    warn_pct: f64,
    full_pct: f64,
    critical_pct: f64,
    records: [BinRecord; CATEGORY_COUNT],
}

impl BinMonitor {
    pub fn from_settings(settings: &BinLevelSettings) -> Self {
        Self {
            warn_pct: settings.warn_threshold_percent,
            full_pct: settings.full_threshold_percent,
            critical_pct: settings.critical_threshold_percent,
            records: [BinRecord::default(); CATEGORY_COUNT],
        }
    }

    /// Reread thresholds after a hot reload. States re-settle on the
    /// next measurement.
    pub fn update_settings(&mut self, settings: &BinLevelSettings) {
        self.warn_pct = settings.warn_threshold_percent;
        self.full_pct = settings.full_threshold_percent;
        self.critical_pct = settings.critical_threshold_percent;
    }

    /// Feed one smoothed measurement. Returns the transition when the
    /// bin's state changed.
    pub fn update(
        &mut self,
        category: Category,
        fill_fraction: f64,
        now_ns: u64,
    ) -> Option<BinTransition> {
        let record = &mut self.records[category.idx()];
        record.fill_fraction = fill_fraction;
        record.last_measurement_ns = now_ns;

        let pct = fill_fraction * 100.0;
        let mut next = if pct >= self.critical_pct {
            BinState::Critical
        } else if pct >= self.full_pct {
            BinState::Full
        } else if pct >= self.warn_pct {
            BinState::Warn
        } else {
            BinState::Ok
        };

        // Exit hysteresis: a closed bin re-opens only well below warn.
        if record.state >= BinState::Full
            && next < BinState::Full
            && pct >= self.warn_pct - FULL_EXIT_MARGIN_PCT
        {
            next = BinState::Full;
        }

        if next == record.state {
            return None;
        }
        let from = record.state;
        record.state = next;
        info!(category = %category, from = from.as_str(), to = next.as_str(), pct, "bin state");
        Some(BinTransition {
            category,
            from,
            to: next,
            fill_fraction,
        })
    }

    #[inline]
    pub fn state(&self, category: Category) -> BinState {
        self.records[category.idx()].state
    }

    #[inline]
    pub fn fill_fraction(&self, category: Category) -> f64 {
        self.records[category.idx()].fill_fraction
    }

    /// Scheduler gate, indexed by `Category::idx()`.
    pub fn accepting(&self) -> [bool; CATEGORY_COUNT] {
        let mut gates = [true; CATEGORY_COUNT];
        for (idx, record) in self.records.iter().enumerate() {
            gates[idx] = record.state.accepts_items();
        }
        gates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BinMonitor {
        // warn 75, full 90, critical 95.
        BinMonitor::from_settings(&BinLevelSettings::default())
    }

    #[test]
    fn rising_fill_walks_the_states() {
        let mut monitor = monitor();
        assert!(monitor.update(Category::Glass, 0.50, 1).is_none());
        let warn = monitor.update(Category::Glass, 0.80, 2).unwrap();
        assert_eq!(warn.to, BinState::Warn);
        let full = monitor.update(Category::Glass, 0.91, 3).unwrap();
        assert_eq!(full.to, BinState::Full);
        let critical = monitor.update(Category::Glass, 0.96, 4).unwrap();
        assert_eq!(critical.to, BinState::Critical);
    }

    #[test]
    fn exactly_at_full_threshold_is_full() {
        let mut monitor = monitor();
        let change = monitor.update(Category::Metal, 0.90, 1).unwrap();
        assert_eq!(change.to, BinState::Full);
        assert!(!monitor.accepting()[Category::Metal.idx()]);
    }

    #[test]
    fn full_exits_only_below_warn_minus_margin() {
        let mut monitor = monitor();
        monitor.update(Category::Metal, 0.92, 1);
        assert_eq!(monitor.state(Category::Metal), BinState::Full);

        // 80% is below full but above warn − 5 (70) → still closed.
        assert!(monitor.update(Category::Metal, 0.80, 2).is_none());
        assert_eq!(monitor.state(Category::Metal), BinState::Full);

        // 71% is still inside the hysteresis band.
        assert!(monitor.update(Category::Metal, 0.71, 3).is_none());

        // 69% is below warn − 5, so the bin re-opens.
        let change = monitor.update(Category::Metal, 0.69, 4).unwrap();
        assert_eq!(change.to, BinState::Ok);
        assert!(monitor.accepting()[Category::Metal.idx()]);
    }

    #[test]
    fn critical_steps_down_to_full_without_hysteresis_release() {
        let mut monitor = monitor();
        monitor.update(Category::Carton, 0.97, 1);
        assert_eq!(monitor.state(Category::Carton), BinState::Critical);
        let change = monitor.update(Category::Carton, 0.91, 2).unwrap();
        // Critical → Full is a real de-escalation; the gate stays closed.
        assert_eq!(change.to, BinState::Full);
        assert!(!monitor.accepting()[Category::Carton.idx()]);
    }

    #[test]
    fn categories_are_independent() {
        let mut monitor = monitor();
        monitor.update(Category::Glass, 0.96, 1);
        let gates = monitor.accepting();
        assert!(!gates[Category::Glass.idx()]);
        assert!(gates[Category::Metal.idx()]);
        assert!(gates[Category::Other.idx()]);
    }

    #[test]
    fn fill_fraction_recorded() {
        let mut monitor = monitor();
        monitor.update(Category::Plastic, 0.42, 7);
        assert_eq!(monitor.fill_fraction(Category::Plastic), 0.42);
    }
}
