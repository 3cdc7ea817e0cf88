//! # Exponential Backoff
//!
//! Per-object retry delays for failed reconciles.
//!
//! The delay doubles with every consecutive failure of the same object,
//! starting at `base` and capped at `max`: with the defaults that is
//! 5ms, 10ms, 20ms, ... up to 1000s. A successful reconcile resets the
//! object's sequence.

use cluster_client::ObjectKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    /// Failures seen since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.attempts, self.base, self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to the initial state
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Stateless form: delay for the `error_count`-th consecutive failure
    /// (0-indexed), capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(error_count).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |d| d.min(max))
    }
}

/// Backoff sequences keyed by object identity
#[derive(Debug)]
pub struct BackoffStates {
    base: Duration,
    max: Duration,
    states: Mutex<HashMap<ObjectKey, ExponentialBackoff>>,
}

impl BackoffStates {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key`.
    ///
    /// Returns (delay before the retry, failures so far including this one).
    pub fn record_failure(&self, key: &ObjectKey) -> (Duration, u32) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.clone())
            .or_insert_with(|| ExponentialBackoff::new(self.base, self.max));
        let delay = state.next_backoff();
        (delay, state.attempts())
    }

    /// Forget `key` (on successful reconciliation or when it is dropped)
    pub fn reset(&self, key: &ObjectKey) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(20));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(40));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let max = Duration::from_secs(1000);
        // 5ms * 2^18 = 1310.72s, past the cap
        assert_eq!(
            ExponentialBackoff::calculate_for_error_count(18, Duration::from_millis(5), max),
            max
        );
        // Shift overflow must not panic
        assert_eq!(
            ExponentialBackoff::calculate_for_error_count(200, Duration::from_millis(5), max),
            max
        );
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
    }

    #[test]
    fn test_states_are_per_key() {
        let states = BackoffStates::new(Duration::from_millis(5), Duration::from_secs(1));
        let a = ObjectKey::cluster("a");
        let b = ObjectKey::cluster("b");

        assert_eq!(states.record_failure(&a), (Duration::from_millis(5), 1));
        assert_eq!(states.record_failure(&a), (Duration::from_millis(10), 2));
        assert_eq!(states.record_failure(&b), (Duration::from_millis(5), 1));

        states.reset(&a);
        assert_eq!(states.record_failure(&a), (Duration::from_millis(5), 1));
    }
}
