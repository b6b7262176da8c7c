//! Periodic task timing

use embassy_time::{Duration, Instant};

/// Fixed-period gate used by every periodic task.
///
/// Each task owns its cadences privately. Nothing in the core reads a global
/// clock: callers pass `now` in, which keeps every state machine testable with
/// synthetic instants.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    period: Duration,
    last: Option<Instant>,
}

impl Cadence {
    /// A cadence that is due immediately, then once per `period`.
    pub const fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// A cadence whose first period starts at `start`.
    pub const fn starting_at(period: Duration, start: Instant) -> Self {
        Self {
            period,
            last: Some(start),
        }
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    pub const fn last(&self) -> Option<Instant> {
        self.last
    }

    /// Whether a full period has elapsed since the last mark.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.period,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Marks and returns `true` when due.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.mark(now);
            true
        } else {
            false
        }
    }

    /// Forget the last mark so the next poll fires.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cadence_is_due_immediately() {
        let mut cadence = Cadence::new(Duration::from_secs(10));
        assert!(cadence.poll(Instant::from_secs(0)));
        assert!(!cadence.poll(Instant::from_secs(9)));
        assert!(cadence.poll(Instant::from_secs(10)));
    }

    #[test]
    fn test_starting_at_waits_one_period() {
        let cadence = Cadence::starting_at(Duration::from_secs(150), Instant::from_secs(0));
        assert!(!cadence.is_due(Instant::from_secs(149)));
        assert!(cadence.is_due(Instant::from_secs(150)));
    }

    #[test]
    fn test_reset_fires_next_poll() {
        let mut cadence = Cadence::new(Duration::from_secs(10));
        cadence.mark(Instant::from_secs(100));
        assert!(!cadence.is_due(Instant::from_secs(101)));
        cadence.reset();
        assert!(cadence.is_due(Instant::from_secs(101)));
    }

    #[test]
    fn test_clock_going_backwards_is_not_due() {
        let cadence = Cadence::starting_at(Duration::from_secs(10), Instant::from_secs(50));
        assert!(!cadence.is_due(Instant::from_secs(20)));
    }
}
