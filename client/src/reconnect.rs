//! # Reconnector
//!
//! Exponential backoff with jitter for re-establishing the server
//! connection after a drop:
//!
//! ```text
//! delay  = min(initial * multiplier^(attempt-1), max_delay)
//! jitter = uniform(0, 0.25) * delay
//! ```
//!
//! A bounded attempt budget (`max_attempts > 0`) yields a stop sentinel
//! (`None`) once exceeded; every successful connect resets the sequence.

use rand::Rng;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Zero means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

pub struct Reconnector {
    config: ReconnectConfig,
    attempt: Mutex<u32>,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: Mutex::new(0),
        }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&self) -> Option<Duration> {
        let mut attempt = self.attempt.lock().expect("reconnector lock");
        *attempt += 1;
        if self.config.max_attempts > 0 && *attempt > self.config.max_attempts {
            return None;
        }

        let initial = Duration::from_millis(self.config.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.config.max_delay_ms).as_secs_f64();
        let exponential = initial * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = exponential.min(max);
        let jitter = rand::thread_rng().gen_range(0.0..0.25) * base;
        Some(Duration::from_secs_f64(base + jitter))
    }

    pub fn attempt(&self) -> u32 {
        *self.attempt.lock().expect("reconnector lock")
    }

    /// Called after every successful connect.
    pub fn reset(&self) {
        *self.attempt.lock().expect("reconnector lock") = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            max_attempts,
        }
    }

    fn assert_in_range(delay: Duration, low: f64, high: f64) {
        let secs = delay.as_secs_f64();
        assert!(
            (low..=high).contains(&secs),
            "delay {secs}s outside [{low}, {high}]"
        );
    }

    #[test]
    fn delays_grow_with_cap_and_jitter() {
        let reconnector = Reconnector::new(config(0));
        // base + up to 25% jitter, capped at max_delay before jitter
        assert_in_range(reconnector.next_delay().unwrap(), 1.00, 1.25);
        assert_in_range(reconnector.next_delay().unwrap(), 2.00, 2.50);
        assert_in_range(reconnector.next_delay().unwrap(), 4.00, 5.00);
        assert_in_range(reconnector.next_delay().unwrap(), 8.00, 10.00);
        assert_in_range(reconnector.next_delay().unwrap(), 10.00, 12.50);
        assert_in_range(reconnector.next_delay().unwrap(), 10.00, 12.50);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let reconnector = Reconnector::new(config(0));
        for _ in 0..5 {
            reconnector.next_delay().unwrap();
        }
        reconnector.reset();
        assert_in_range(reconnector.next_delay().unwrap(), 1.00, 1.25);
    }

    #[test]
    fn attempt_budget_yields_stop_sentinel() {
        let reconnector = Reconnector::new(config(3));
        assert!(reconnector.next_delay().is_some());
        assert!(reconnector.next_delay().is_some());
        assert!(reconnector.next_delay().is_some());
        assert!(reconnector.next_delay().is_none(), "k+1-th call must stop");
        assert!(reconnector.next_delay().is_none());
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let reconnector = Reconnector::new(config(0));
        for _ in 0..1_000 {
            reconnector.reset();
            assert_in_range(reconnector.next_delay().unwrap(), 1.00, 1.25);
        }
    }
}
