//! Failure backoff with a fixed schedule; the last delay repeats.

use std::time::{Duration, Instant};

pub(crate) struct Backoff {
    schedule: Vec<Duration>,
    index: usize,
    next_allowed_at: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(schedule: Vec<Duration>) -> Self {
        Self {
            schedule,
            index: 0,
            next_allowed_at: None,
        }
    }

    /// The schedule used for sync retries and realtime reconnects.
    pub(crate) fn standard() -> Self {
        Self::new(vec![
            Duration::from_millis(500),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(3),
        ])
    }

    pub(crate) fn can_attempt(&self) -> bool {
        match self.next_allowed_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub(crate) fn on_failure(&mut self) -> Duration {
        let delay = self
            .schedule
            .get(self.index)
            .cloned()
            .unwrap_or_else(|| Duration::from_secs(1));
        self.next_allowed_at = Some(Instant::now() + delay);
        if self.index + 1 < self.schedule.len() {
            self.index += 1;
        }
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.index = 0;
        self.next_allowed_at = None;
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.next_allowed_at
            .and_then(|at| at.checked_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_escalate_and_saturate() {
        let mut b = Backoff::new(vec![Duration::from_millis(10), Duration::from_millis(20)]);
        assert!(b.can_attempt());
        assert_eq!(b.on_failure(), Duration::from_millis(10));
        assert_eq!(b.on_failure(), Duration::from_millis(20));
        assert_eq!(b.on_failure(), Duration::from_millis(20), "last delay repeats");
        assert!(!b.can_attempt());
        assert!(b.remaining().is_some());
    }

    #[test]
    fn reset_clears_gate() {
        let mut b = Backoff::new(vec![Duration::from_secs(60)]);
        b.on_failure();
        assert!(!b.can_attempt());
        b.reset();
        assert!(b.can_attempt());
        assert!(b.remaining().is_none());
    }
}
