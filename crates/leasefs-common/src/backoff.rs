//! Exponential backoff for polling and retry loops.
//!
//! Two loops in the client wait on the remote: blocking `setlk` polls until
//! the lock is free, and the background flush queue retries mutations while
//! the remote is unreachable. Both double their wait up to a ceiling; only
//! the lock poll has a caller-supplied deadline.

use std::time::{Duration, Instant};

/// Doubling wait schedule with a ceiling and an optional deadline.
///
/// # Example
///
/// ```
/// use leasefs_common::ExponentialBackoff;
/// use std::time::Duration;
///
/// let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(40));
/// assert_eq!(backoff.next_wait(), Some(Duration::from_millis(10)));
/// assert_eq!(backoff.next_wait(), Some(Duration::from_millis(20)));
/// assert_eq!(backoff.next_wait(), Some(Duration::from_millis(40)));
/// assert_eq!(backoff.next_wait(), Some(Duration::from_millis(40)));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    deadline: Option<Instant>,
    attempts: u32,
}

impl ExponentialBackoff {
    /// A schedule starting at `initial` and capped at `max`, without deadline.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            deadline: None,
            attempts: 0,
        }
    }

    /// Stops the schedule at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// The next wait, or `None` once the deadline has passed.
    ///
    /// The returned wait never sleeps past the deadline.
    pub fn next_wait(&mut self) -> Option<Duration> {
        let remaining = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                Some(remaining)
            }
            None => None,
        };

        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;
        Some(remaining.map_or(wait, |r| wait.min(r)))
    }

    /// Sleeps for the next wait; returns false once the deadline has passed.
    pub fn sleep(&mut self) -> bool {
        match self.next_wait() {
            Some(wait) => {
                std::thread::sleep(wait);
                true
            }
            None => false,
        }
    }

    /// Starts over from the initial wait.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Waits handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if a deadline is set and has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let waits: Vec<_> = (0..9).map(|_| b.next_wait().unwrap()).collect();
        assert_eq!(waits[0], Duration::from_millis(10));
        assert_eq!(waits[1], Duration::from_millis(20));
        assert_eq!(waits[6], Duration::from_millis(640));
        assert_eq!(waits[7], Duration::from_secs(1));
        assert_eq!(waits[8], Duration::from_secs(1));
        assert_eq!(b.attempts(), 9);
    }

    #[test]
    fn test_backoff_respects_deadline() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let mut b = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))
            .with_deadline(Some(deadline));
        let mut slept = 0;
        while b.sleep() {
            slept += 1;
            assert!(slept < 100, "deadline never reached");
        }
        assert!(b.is_expired());
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_backoff_wait_clamped_to_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut b = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(10))
            .with_deadline(Some(deadline));
        let wait = b.next_wait().unwrap();
        assert!(wait <= Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(100));
        b.next_wait();
        b.next_wait();
        b.reset();
        assert_eq!(b.next_wait(), Some(Duration::from_millis(5)));
        assert_eq!(b.attempts(), 1);
    }

    #[test]
    fn test_ceiling_below_initial_is_raised() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(b.next_wait(), Some(Duration::from_millis(50)));
        assert_eq!(b.next_wait(), Some(Duration::from_millis(50)));
    }
}
