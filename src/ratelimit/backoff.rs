//! Backoff policy and state for rate-limited agent runs.
//!
//! The delay is a pure function of the attempt number: exponential growth from a
//! base, clamped to a cap, then inflated by up to 10% jitter so instances sharing
//! a backend do not retry in lockstep.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_MS: u64 = 5_000;
pub const DEFAULT_MAX_MS: u64 = 300_000;
pub const DEFAULT_JITTER: f64 = 0.10;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay for the first attempt (ms).
    pub base_ms: u64,
    /// Cap applied before jitter (ms).
    pub max_ms: u64,
    /// Maximum upward jitter as a fraction of the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_MS,
            max_ms: DEFAULT_MAX_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before jitter: `base * 2^(attempt-1)`, capped. Zero for attempt <= 0.
    pub fn base_delay_ms(&self, attempt: i64) -> u64 {
        if attempt <= 0 {
            return 0;
        }
        let exponent = (attempt - 1).min(32) as u32;
        self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms)
    }

    /// Delay with random jitter in `[0, jitter)`.
    pub fn delay_ms(&self, attempt: i64) -> u64 {
        let unit: f64 = rand::rng().random();
        self.delay_with_unit(attempt, unit)
    }

    /// Delay with a caller-supplied jitter sample in `[0, 1)`.
    pub fn delay_with_unit(&self, attempt: i64, unit: f64) -> u64 {
        let delay = self.base_delay_ms(attempt);
        let extra = (delay as f64 * self.jitter.max(0.0) * unit.clamp(0.0, 1.0)).floor() as u64;
        delay + extra
    }
}

/// Backoff for `attempt` under the default policy (5s base, 300s cap, +10% jitter).
pub fn calculate_backoff_ms(attempt: i64) -> u64 {
    BackoffPolicy::default().delay_ms(attempt)
}

/// Consecutive rate-limit bookkeeping owned by the engine.
#[derive(Debug, Default)]
pub struct BackoffState {
    /// Consecutive rate-limit hits since the last success.
    attempt: u32,
    /// When the current wait ends (None = not backing off).
    backoff_until: Option<Instant>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if a wait is currently in progress.
    pub fn is_backing_off(&self) -> bool {
        self.backoff_until.map(|until| Instant::now() < until).unwrap_or(false)
    }

    /// Remaining wait, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.backoff_until.and_then(|until| {
            let now = Instant::now();
            if now < until { Some(until - now) } else { None }
        })
    }

    /// Record a detected rate limit and return how long to wait.
    ///
    /// The wait is the larger of the policy delay and the agent's retry-after hint.
    pub fn record_rate_limit(&mut self, policy: &BackoffPolicy, retry_after: Option<Duration>) -> Duration {
        self.attempt += 1;
        let policy_delay = Duration::from_millis(policy.delay_ms(i64::from(self.attempt)));
        let delay = retry_after.map_or(policy_delay, |hint| hint.max(policy_delay));
        self.backoff_until = Some(Instant::now() + delay);

        tracing::warn!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Rate limited, backing off"
        );
        delay
    }

    /// Mark the wait as over without resetting the attempt counter.
    pub fn finish_wait(&mut self) {
        self.backoff_until = None;
    }

    /// Record a successful iteration. Returns true if a backoff streak was cleared.
    pub fn record_success(&mut self) -> bool {
        let had_streak = self.attempt > 0;
        self.attempt = 0;
        self.backoff_until = None;
        had_streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_non_positive_attempt_is_zero() {
        for attempt in [-10, -1, 0] {
            assert_eq!(calculate_backoff_ms(attempt), 0);
        }
    }

    #[test]
    fn test_delay_bounds() {
        for _ in 0..50 {
            let d1 = calculate_backoff_ms(1);
            assert!((5_000..=5_500).contains(&d1), "attempt 1 gave {}", d1);
            let d2 = calculate_backoff_ms(2);
            assert!((10_000..=11_000).contains(&d2), "attempt 2 gave {}", d2);
            let d4 = calculate_backoff_ms(4);
            assert!((40_000..=44_000).contains(&d4), "attempt 4 gave {}", d4);
        }
    }

    #[test]
    fn test_cap_holds() {
        for attempt in [10, 20, 64, 1_000, i64::MAX] {
            let delay = calculate_backoff_ms(attempt);
            assert!((300_000..=330_000).contains(&delay), "attempt {} gave {}", attempt, delay);
        }
    }

    #[test]
    fn test_deterministic_modulo_jitter() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with_unit(3, 0.0), 20_000);
        assert_eq!(policy.delay_with_unit(3, 0.5), 21_000);
        assert_eq!(policy.base_delay_ms(3), 20_000);
    }

    #[test]
    fn test_custom_policy() {
        let policy = BackoffPolicy {
            base_ms: 10,
            max_ms: 50,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_ms(1), 10);
        assert_eq!(policy.delay_ms(3), 40);
        assert_eq!(policy.delay_ms(4), 50);
    }

    #[test]
    fn test_backoff_state_new() {
        let state = BackoffState::new();
        assert!(!state.is_backing_off());
        assert_eq!(state.attempt(), 0);
        assert!(state.remaining().is_none());
    }

    #[test]
    fn test_record_rate_limit_increments_attempt() {
        let mut state = BackoffState::new();
        let policy = BackoffPolicy::default();

        let first = state.record_rate_limit(&policy, None);
        assert_eq!(state.attempt(), 1);
        assert!(state.is_backing_off());
        assert!(first >= Duration::from_millis(5_000));

        let second = state.record_rate_limit(&policy, None);
        assert_eq!(state.attempt(), 2);
        assert!(second >= Duration::from_millis(10_000));
    }

    #[test]
    fn test_use_larger_of_retry_after_and_policy() {
        let mut state = BackoffState::new();
        let policy = BackoffPolicy::default();

        let delay = state.record_rate_limit(&policy, Some(Duration::from_secs(100)));
        assert_eq!(delay, Duration::from_secs(100));

        let mut state = BackoffState::new();
        let delay = state.record_rate_limit(&policy, Some(Duration::from_secs(1)));
        assert!(delay >= Duration::from_millis(5_000));
    }

    #[test]
    fn test_record_success_clears_streak() {
        let mut state = BackoffState::new();
        let policy = BackoffPolicy::default();

        assert!(!state.record_success());
        state.record_rate_limit(&policy, None);
        assert!(state.record_success());
        assert_eq!(state.attempt(), 0);
        assert!(!state.is_backing_off());
        assert!(state.remaining().is_none());
    }

    #[test]
    fn test_finish_wait_keeps_attempt() {
        let mut state = BackoffState::new();
        let policy = BackoffPolicy::default();
        state.record_rate_limit(&policy, None);
        state.finish_wait();
        assert!(!state.is_backing_off());
        assert!(state.remaining().is_none());
        assert_eq!(state.attempt(), 1);
    }

    #[test]
    fn test_backoff_expires() {
        let mut state = BackoffState::new();
        let policy = BackoffPolicy {
            base_ms: 10,
            max_ms: 10,
            jitter: 0.0,
        };
        state.record_rate_limit(&policy, None);
        assert!(state.is_backing_off());
        thread::sleep(Duration::from_millis(20));
        assert!(!state.is_backing_off());
    }
}
