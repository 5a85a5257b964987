//! Monotonic time source with a virtual replacement for tests.
//!
//! All core logic takes explicit nanosecond timestamps so timing behavior
//! can be asserted deterministically. The production clock wraps
//! `std::time::Instant`; the virtual clock advances only when asked.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Convert fractional seconds to nanoseconds, saturating at zero.
/// Rounds to the nearest nanosecond so decimal config values land exact.
#[inline]
pub fn secs_to_ns(secs: f64) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (secs * NANOS_PER_SEC as f64).round() as u64
    }
}

/// Convert milliseconds to nanoseconds.
#[inline]
pub const fn millis_to_ns(millis: u64) -> u64 {
    millis * 1_000_000
}

/// Monotonic time source.
///
/// `now_ns` is monotonic and starts near zero at construction so
/// timestamps stay small and comparable across components sharing one
/// clock instance.
pub trait Clock: Send + Sync {
    /// Current monotonic timestamp [ns].
    fn now_ns(&self) -> u64;

    /// Block the calling thread for the given duration.
    fn sleep(&self, duration: Duration);

    /// Block the calling thread until the given monotonic deadline [ns].
    /// Returns immediately if the deadline has passed.
    fn sleep_until(&self, deadline_ns: u64) {
        let now = self.now_ns();
        if deadline_ns > now {
            self.sleep(Duration::from_nanos(deadline_ns - now));
        }
    }
}

/// Production clock backed by `Instant`.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock for tests.
///
/// Time advances only via [`VirtualClock::advance`] or
/// [`VirtualClock::set_ns`]. A thread sleeping on the virtual clock is
/// woken when another thread advances past its deadline, which lets
/// threaded code run under test control. With auto-advance enabled a
/// `sleep` instead advances the clock itself, so single-threaded
/// harnesses can drive code that sleeps without deadlocking.
pub struct VirtualClock {
    now: Mutex<u64>,
    advanced: Condvar,
    auto_advance: std::sync::atomic::AtomicBool,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(0),
            advanced: Condvar::new(),
            auto_advance: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// When enabled, `sleep` advances the clock instead of blocking.
    pub fn set_auto_advance(&self, enabled: bool) {
        self.auto_advance
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    fn auto_advances(&self) -> bool {
        self.auto_advance
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Advance the clock by `delta` and wake sleepers.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta.as_nanos() as u64;
        self.advanced.notify_all();
    }

    /// Jump the clock to an absolute timestamp [ns]. Never moves backwards.
    pub fn set_ns(&self, ts_ns: u64) {
        let mut now = self.now.lock();
        if ts_ns > *now {
            *now = ts_ns;
            self.advanced.notify_all();
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now_ns(&self) -> u64 {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        if self.auto_advances() {
            self.advance(duration);
            return;
        }
        let deadline = self.now_ns() + duration.as_nanos() as u64;
        let mut now = self.now.lock();
        while *now < deadline {
            self.advanced.wait(&mut now);
        }
    }

    fn sleep_until(&self, deadline_ns: u64) {
        if self.auto_advances() {
            self.set_ns(deadline_ns);
            return;
        }
        let mut now = self.now.lock();
        while *now < deadline_ns {
            self.advanced.wait(&mut now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        clock.sleep(Duration::from_millis(1));
        let b = clock.now_ns();
        assert!(b > a);
    }

    #[test]
    fn virtual_clock_starts_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now_ns(), 0);
    }

    #[test]
    fn virtual_clock_advance() {
        let clock = VirtualClock::new();
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ns(), 2 * NANOS_PER_SEC);
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now_ns(), 2_500_000_000);
    }

    #[test]
    fn virtual_clock_set_never_goes_backwards() {
        let clock = VirtualClock::new();
        clock.set_ns(1_000);
        clock.set_ns(500);
        assert_eq!(clock.now_ns(), 1_000);
    }

    #[test]
    fn virtual_clock_wakes_sleeper() {
        use std::sync::Arc;

        let clock = Arc::new(VirtualClock::new());
        let sleeper = Arc::clone(&clock);
        let handle = std::thread::spawn(move || {
            sleeper.sleep_until(1_000_000);
            sleeper.now_ns()
        });
        // Give the sleeper a moment to park, then release it.
        std::thread::sleep(Duration::from_millis(10));
        clock.advance(Duration::from_millis(2));
        assert!(handle.join().unwrap() >= 1_000_000);
    }

    #[test]
    fn auto_advance_sleep_moves_time_forward() {
        let clock = VirtualClock::new();
        clock.set_auto_advance(true);
        clock.sleep(Duration::from_millis(500));
        assert_eq!(clock.now_ns(), 500_000_000);
        clock.sleep_until(2 * NANOS_PER_SEC);
        assert_eq!(clock.now_ns(), 2 * NANOS_PER_SEC);
        // A past deadline does not move time backwards.
        clock.sleep_until(NANOS_PER_SEC);
        assert_eq!(clock.now_ns(), 2 * NANOS_PER_SEC);
    }

    #[test]
    fn secs_conversion() {
        assert_eq!(secs_to_ns(1.5), 1_500_000_000);
        assert_eq!(secs_to_ns(0.0), 0);
        assert_eq!(secs_to_ns(-2.0), 0);
        assert_eq!(millis_to_ns(250), 250_000_000);
    }
}
