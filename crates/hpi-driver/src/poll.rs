//! Delays and bounded busy-polling.
//!
//! Every wait in the bootloader and the HIF transport goes through
//! [`spin_until`]: at most `max_polls` evaluations of the condition with a
//! fixed delay between them, then one final check. Nothing here blocks on
//! an OS primitive.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Microsecond delay primitive.
pub trait Delay: Debug + Send + Sync {
    /// Wait at least `us` microseconds.
    fn delay_us(&self, us: u32);
}

/// Real-time delay: sleeps for long waits, spins for short ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinDelay;

impl SpinDelay {
    /// Waits at or above this are handed to the scheduler.
    const SLEEP_THRESHOLD_US: u32 = 100;
}

impl Delay for SpinDelay {
    fn delay_us(&self, us: u32) {
        if us == 0 {
            return;
        }
        let wait = Duration::from_micros(u64::from(us));
        if us >= Self::SLEEP_THRESHOLD_US {
            std::thread::sleep(wait);
            return;
        }
        let start = Instant::now();
        while start.elapsed() < wait {
            std::hint::spin_loop();
        }
    }
}

/// Delay that returns immediately, keeping a tally of what was asked for.
#[derive(Debug, Default)]
pub struct NoDelay {
    requested_us: AtomicU64,
}

impl NoDelay {
    /// New zero tally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total microseconds requested so far.
    #[must_use]
    pub fn requested_us(&self) -> u64 {
        self.requested_us.load(Ordering::Relaxed)
    }
}

impl Delay for NoDelay {
    fn delay_us(&self, us: u32) {
        self.requested_us.fetch_add(u64::from(us), Ordering::Relaxed);
    }
}

/// Budget for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Condition evaluations before giving up (a final check follows).
    pub max_polls: u32,
    /// Delay between evaluations (µs); zero spins.
    pub delay_us: u32,
}

impl PollConfig {
    /// Budget of `max_polls` with `delay_us` between polls.
    #[must_use]
    pub const fn new(max_polls: u32, delay_us: u32) -> Self {
        Self { max_polls, delay_us }
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spin {
    /// Whether the condition held before the budget ran out.
    pub satisfied: bool,
    /// Polls spent.
    pub polls: u32,
}

/// Poll `done` until it returns true or `cfg.max_polls` polls elapse.
pub fn spin_until(delay: &dyn Delay, cfg: PollConfig, mut done: impl FnMut() -> bool) -> Spin {
    for polls in 0..cfg.max_polls {
        if done() {
            return Spin {
                satisfied: true,
                polls,
            };
        }
        if cfg.delay_us > 0 {
            delay.delay_us(cfg.delay_us);
        }
    }
    Spin {
        satisfied: done(),
        polls: cfg.max_polls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn stops_as_soon_as_condition_holds() {
        let delay = NoDelay::new();
        let calls = Cell::new(0u32);
        let spin = spin_until(&delay, PollConfig::new(100, 5), || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        });
        assert!(spin.satisfied);
        assert_eq!(spin.polls, 2);
        assert_eq!(delay.requested_us(), 10);
    }

    #[test]
    fn never_satisfied_condition_terminates() {
        let delay = NoDelay::new();
        let calls = Cell::new(0u32);
        let spin = spin_until(&delay, PollConfig::new(1000, 1), || {
            calls.set(calls.get() + 1);
            false
        });
        assert!(!spin.satisfied);
        assert_eq!(spin.polls, 1000);
        assert_eq!(calls.get(), 1001);
        assert_eq!(delay.requested_us(), 1000);
    }

    #[test]
    fn zero_budget_checks_once() {
        let spin = spin_until(&NoDelay::new(), PollConfig::new(0, 0), || true);
        assert!(spin.satisfied);
        assert_eq!(spin.polls, 0);
    }

    #[test]
    fn spin_delay_waits() {
        let start = Instant::now();
        SpinDelay.delay_us(50);
        SpinDelay.delay_us(200);
        assert!(start.elapsed() >= Duration::from_micros(250));
    }
}
