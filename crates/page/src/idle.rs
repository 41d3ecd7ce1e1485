//! Network-idle detection.
//!
//! A three-state machine: once the transfer count stays at or below
//! the allowed maximum for the full threshold without interruption,
//! the notification fires and the machine parks in `Done` for the rest
//! of the page's lifetime. Any transient break resets the clock.

use std::time::{Duration, Instant};

/// How long the idle condition must hold before the signal fires.
pub const IDLE_THRESHOLD: Duration = Duration::from_millis(500);

/// In-flight transfers tolerated by the "almost idle" detector.
pub const ALMOST_IDLE_MAX_INFLIGHT: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IdleState {
    Init,
    Triggered(Instant),
    Done,
}

#[derive(Debug)]
pub struct IdleNotification {
    max_in_flight: usize,
    threshold: Duration,
    state: IdleState,
}

impl IdleNotification {
    pub fn new(max_in_flight: usize, threshold: Duration) -> Self {
        Self {
            max_in_flight,
            threshold,
            state: IdleState::Init,
        }
    }

    /// Feed the current transfer count. Returns true exactly once, the
    /// moment the condition has held for the full threshold.
    pub fn poll(&mut self, in_flight: usize, now: Instant) -> bool {
        match self.state {
            IdleState::Done => false,
            IdleState::Init => {
                if in_flight <= self.max_in_flight {
                    self.state = IdleState::Triggered(now);
                    // A zero threshold fires immediately.
                    if self.threshold.is_zero() {
                        self.state = IdleState::Done;
                        return true;
                    }
                }
                false
            }
            IdleState::Triggered(since) => {
                if in_flight > self.max_in_flight {
                    self.state = IdleState::Init;
                    return false;
                }
                if now.duration_since(since) >= self.threshold {
                    self.state = IdleState::Done;
                    return true;
                }
                false
            }
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == IdleState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn fires_after_uninterrupted_threshold() {
        let base = Instant::now();
        let mut idle = IdleNotification::new(0, IDLE_THRESHOLD);
        assert!(!idle.poll(0, base));
        assert!(!idle.poll(0, at(base, 499)));
        assert!(idle.poll(0, at(base, 500)));
        assert!(idle.is_done());
    }

    #[test]
    fn transient_break_resets_the_clock() {
        let base = Instant::now();
        let mut idle = IdleNotification::new(0, IDLE_THRESHOLD);
        assert!(!idle.poll(0, base));
        // One new transfer at 499 ms: back to init.
        assert!(!idle.poll(1, at(base, 499)));
        // Idle again, but the clock restarts here.
        assert!(!idle.poll(0, at(base, 500)));
        assert!(!idle.poll(0, at(base, 999)));
        assert!(idle.poll(0, at(base, 1000)));
    }

    #[test]
    fn done_is_terminal() {
        let base = Instant::now();
        let mut idle = IdleNotification::new(0, IDLE_THRESHOLD);
        idle.poll(0, base);
        assert!(idle.poll(0, at(base, 500)));
        // Later dips never re-emit.
        assert!(!idle.poll(1, at(base, 600)));
        assert!(!idle.poll(0, at(base, 1200)));
        assert!(!idle.poll(0, at(base, 1700)));
    }

    #[test]
    fn almost_idle_tolerates_two_transfers() {
        let base = Instant::now();
        let mut idle = IdleNotification::new(ALMOST_IDLE_MAX_INFLIGHT, IDLE_THRESHOLD);
        assert!(!idle.poll(2, base));
        assert!(idle.poll(2, at(base, 500)));
    }
}
