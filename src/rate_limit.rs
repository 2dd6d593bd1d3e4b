// ⏱️ Fixed-interval gate - one per upstream source
//
// Courtesy pacing: a call is allowed only once `interval` has elapsed since the
// previous call to the same source. Time is read through the Clock trait so the
// gate can be exercised without sleeping.

use std::time::{Duration, Instant};

// ============================================================================
// CLOCK
// ============================================================================

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock + thread sleep
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// INTERVAL GATE
// ============================================================================

pub struct IntervalGate {
    interval: Duration,
    last_call: Option<Instant>,
    clock: Box<dyn Clock>,
}

impl IntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Box::new(SystemClock))
    }

    pub fn with_clock(interval: Duration, clock: Box<dyn Clock>) -> Self {
        IntervalGate {
            interval,
            last_call: None,
            clock,
        }
    }

    /// Time still to wait before the next call may go out
    pub fn pending_wait(&self) -> Duration {
        match self.last_call {
            None => Duration::ZERO,
            Some(last) => self
                .interval
                .saturating_sub(self.clock.now().saturating_duration_since(last)),
        }
    }

    /// Block until the interval has elapsed, then record the call
    pub fn acquire(&mut self) {
        let wait = self.pending_wait();
        if !wait.is_zero() {
            log::debug!("rate gate: waiting {:?}", wait);
            self.clock.sleep(wait);
        }
        self.last_call = Some(self.clock.now());
    }

    /// Sleep on the gate's clock (429 back-off)
    pub fn pause(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ManualClock;

    #[test]
    fn test_first_call_passes_immediately() {
        let clock = ManualClock::new();
        let mut gate = IntervalGate::with_clock(Duration::from_secs(1), Box::new(clock.clone()));

        assert_eq!(gate.pending_wait(), Duration::ZERO);
        gate.acquire();
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_back_to_back_calls_are_spaced() {
        let clock = ManualClock::new();
        let mut gate = IntervalGate::with_clock(Duration::from_secs(1), Box::new(clock.clone()));

        gate.acquire();
        gate.acquire();
        gate.acquire();

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(1)]);
    }

    #[test]
    fn test_elapsed_time_counts_toward_interval() {
        let clock = ManualClock::new();
        let mut gate = IntervalGate::with_clock(Duration::from_millis(1000), Box::new(clock.clone()));

        gate.acquire();
        clock.advance(Duration::from_millis(700));
        assert_eq!(gate.pending_wait(), Duration::from_millis(300));

        clock.advance(Duration::from_millis(500));
        assert_eq!(gate.pending_wait(), Duration::ZERO);
        gate.acquire();
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_zero_interval_never_waits() {
        let clock = ManualClock::new();
        let mut gate = IntervalGate::with_clock(Duration::ZERO, Box::new(clock.clone()));
        for _ in 0..5 {
            gate.acquire();
        }
        assert!(clock.sleeps().is_empty());
    }
}
