//! Reconnect delay policy for the upstream connection.

use std::time::Duration;

/// Exponential backoff with a capped interval and no attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl Backoff {
    /// Infinite sequence of delays starting at `initial`.
    #[must_use]
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.initial.min(self.max),
            max: self.max,
            factor: self.factor.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    max: Duration,
    factor: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current
            .checked_mul(self.factor)
            .map_or(self.max, |d| d.min(self.max));
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(700),
            factor: 2,
        };
        let delays: Vec<u128> = backoff.delays().take(6).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 700, 700, 700]);
    }

    #[test]
    fn test_delays_never_end() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delays().take(10_000).count(), 10_000);
    }

    #[test]
    fn test_initial_above_cap_is_clamped() {
        let backoff = Backoff {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(30),
            factor: 2,
        };
        assert_eq!(backoff.delays().next(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_factor_keeps_interval_constant() {
        let backoff = Backoff {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            factor: 0,
        };
        let delays: Vec<Duration> = backoff.delays().take(3).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_millis(50)));
    }

    #[test]
    fn test_overflow_saturates_at_cap() {
        let backoff = Backoff {
            initial: Duration::from_secs(u64::MAX / 2),
            max: Duration::MAX,
            factor: 4,
        };
        let mut delays = backoff.delays();
        delays.next();
        assert_eq!(delays.next(), Some(Duration::MAX));
    }
}
