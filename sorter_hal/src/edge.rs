//! Debounced edge detection for digital inputs.
//!
//! Used for the camera-trigger input and the E-stop line. Two matching
//! edges closer than the debounce window collapse into one event. The
//! detector is a pure sampler; the orchestrator owns the poll loop and
//! the channel the events land on.

use sorter_common::config::TriggerMode;

use crate::gpio::Level;

/// One accepted edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Monotonic timestamp of the sample that saw the edge [ns].
    pub ts_ns: u64,
    /// True for a low→high transition.
    pub rising: bool,
}

/// Debounced edge detector over polled samples.
#[derive(Debug)]
pub struct EdgeDetector {
    mode: TriggerMode,
    debounce_ns: u64,
    last_level: Option<Level>,
    last_accepted_ns: Option<u64>,
}

impl EdgeDetector {
    pub fn new(mode: TriggerMode, debounce_ns: u64) -> Self {
        Self {
            mode,
            debounce_ns,
            last_level: None,
            last_accepted_ns: None,
        }
    }

    /// Feed one sample. Returns an event when a matching, non-bounced
    /// edge is observed. The first sample only seeds the level.
    pub fn sample(&mut self, level: Level, now_ns: u64) -> Option<EdgeEvent> {
        let previous = self.last_level.replace(level);
        let previous = previous?;
        if previous == level {
            return None;
        }

        let rising = level.is_high();
        let matches = match self.mode {
            TriggerMode::Rising => rising,
            TriggerMode::Falling => !rising,
        };
        if !matches {
            return None;
        }

        if let Some(last) = self.last_accepted_ns {
            if now_ns.saturating_sub(last) < self.debounce_ns {
                // Bounce: collapse into the previous event.
                return None;
            }
        }
        self.last_accepted_ns = Some(now_ns);
        Some(EdgeEvent { ts_ns: now_ns, rising })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(debounce_ms: u64) -> EdgeDetector {
        EdgeDetector::new(TriggerMode::Rising, debounce_ms * 1_000_000)
    }

    #[test]
    fn first_sample_seeds_without_event() {
        let mut det = detector(50);
        assert_eq!(det.sample(Level::High, 0), None);
    }

    #[test]
    fn rising_edge_detected() {
        let mut det = detector(50);
        det.sample(Level::Low, 0);
        let event = det.sample(Level::High, 1_000_000).unwrap();
        assert!(event.rising);
        assert_eq!(event.ts_ns, 1_000_000);
    }

    #[test]
    fn falling_edges_ignored_in_rising_mode() {
        let mut det = detector(50);
        det.sample(Level::Low, 0);
        det.sample(Level::High, 1_000_000).unwrap();
        assert_eq!(det.sample(Level::Low, 2_000_000), None);
    }

    #[test]
    fn bounce_within_window_collapses() {
        let mut det = detector(50);
        det.sample(Level::Low, 0);
        assert!(det.sample(Level::High, 10_000_000).is_some());
        // Bounce: low then high again 20 ms later, inside the 50 ms window.
        det.sample(Level::Low, 20_000_000);
        assert_eq!(det.sample(Level::High, 30_000_000), None);
        // A clean edge after the window is accepted.
        det.sample(Level::Low, 70_000_000);
        assert!(det.sample(Level::High, 80_000_000).is_some());
    }

    #[test]
    fn steady_level_produces_nothing() {
        let mut det = detector(50);
        for t in 0..5u64 {
            assert_eq!(det.sample(Level::High, t * 1_000_000), None);
        }
    }

    #[test]
    fn falling_mode_detects_falling() {
        let mut det = EdgeDetector::new(TriggerMode::Falling, 0);
        det.sample(Level::High, 0);
        let event = det.sample(Level::Low, 1_000).unwrap();
        assert!(!event.rising);
    }
}
