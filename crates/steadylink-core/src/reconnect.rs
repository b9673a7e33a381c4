//! Reconnect backoff and stop/continue decisions.

use std::time::Duration;

use crate::events::{DisconnectCause, DisconnectReason};

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(3);
/// Default multiplier applied per attempt.
pub const DEFAULT_GROWTH: f64 = 1.5;
/// Default upper bound on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Outcome of a reconnect decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Stop for good.
    Stop(DisconnectCause),
}

/// Pure reconnect policy: `min(base * growth^(attempt-1), cap)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    base: Duration,
    growth: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_GROWTH, DEFAULT_MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectPolicy {
    /// Create a policy. A growth factor below 1 is clamped to 1.
    #[must_use]
    pub fn new(base: Duration, growth: f64, max_delay: Duration, max_attempts: u32) -> Self {
        let growth = if growth.is_finite() && growth >= 1.0 { growth } else { 1.0 };
        Self {
            base,
            growth,
            max_delay,
            max_attempts,
        }
    }

    /// Attempts allowed before giving up.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (1-based; 0 is treated as 1).
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.growth.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether attempt `attempt` may be made after a close with `reason`.
    #[must_use]
    pub const fn should_reconnect(&self, reason: &DisconnectReason, attempt: u32) -> bool {
        !reason.is_logged_out() && attempt <= self.max_attempts
    }

    /// Combine [`Self::should_reconnect`] and [`Self::next_delay`].
    #[must_use]
    pub fn decide(&self, reason: &DisconnectReason, attempt: u32) -> ReconnectDecision {
        if reason.is_logged_out() {
            ReconnectDecision::Stop(DisconnectCause::LoggedOut)
        } else if attempt > self.max_attempts {
            ReconnectDecision::Stop(DisconnectCause::Exhausted {
                attempts: attempt.saturating_sub(1),
            })
        } else {
            ReconnectDecision::Retry {
                attempt,
                delay: self.next_delay(attempt),
            }
        }
    }
}

/// Reconnect bookkeeping for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempts: u32,
    last_delay: Option<Duration>,
}

impl ReconnectState {
    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay of the most recently scheduled attempt.
    #[must_use]
    pub const fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Number of the attempt that would follow the next failure.
    #[must_use]
    pub const fn next_attempt(&self) -> u32 {
        self.attempts.saturating_add(1)
    }

    /// Record that `attempt` was scheduled after `delay`.
    pub const fn record(&mut self, attempt: u32, delay: Duration) {
        self.attempts = attempt;
        self.last_delay = Some(delay);
    }

    /// Reset after a successful open.
    pub const fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> DisconnectReason {
        DisconnectReason::connection_lost("socket reset")
    }

    #[test]
    fn test_first_attempt_uses_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(1), Duration::from_secs(3));
        assert_eq!(policy.next_delay(0), Duration::from_secs(3));
        assert_eq!(policy.next_delay(2), Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_grows_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(5), Duration::from_micros(15_187_500));
        assert_eq!(policy.next_delay(6), Duration::from_micros(22_781_250));
        assert_eq!(policy.next_delay(7), Duration::from_secs(30));
        assert_eq!(policy.next_delay(50), Duration::from_secs(30));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_is_non_decreasing() {
        let policy = ReconnectPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=60 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went down");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_logged_out_never_reconnects() {
        let policy = ReconnectPolicy::default();
        for attempt in [1, 2, 50] {
            assert!(!policy.should_reconnect(&DisconnectReason::logged_out(), attempt));
        }
        assert_eq!(
            policy.decide(&DisconnectReason::logged_out(), 1),
            ReconnectDecision::Stop(DisconnectCause::LoggedOut)
        );
    }

    #[test]
    fn test_attempt_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_reconnect(&lost(), 1));
        assert!(policy.should_reconnect(&lost(), 50));
        assert!(!policy.should_reconnect(&lost(), 51));
        assert_eq!(
            policy.decide(&lost(), 51),
            ReconnectDecision::Stop(DisconnectCause::Exhausted { attempts: 50 })
        );
    }

    #[test]
    fn test_decide_retry_carries_delay() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            3,
        );
        assert_eq!(
            policy.decide(&DisconnectReason::new(515, "restart required"), 3),
            ReconnectDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(400)
            }
        );
    }

    #[test]
    fn test_state_resets() {
        let mut state = ReconnectState::default();
        state.record(4, Duration::from_secs(10));
        assert_eq!(state.attempts(), 4);
        assert_eq!(state.next_attempt(), 5);
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.last_delay(), None);
    }
}
