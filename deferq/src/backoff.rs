//! Exponential backoff used while the store is unavailable.
//!
//! The delay doubles with each consecutive failure, is clamped to a maximum, and is spread by a
//! relative jitter so that many workers losing the same store do not retry in lockstep.
use std::time::Duration;

use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BackoffStrategy {
    base: TimeDelta,
    max: Option<TimeDelta>,
    jitter: Option<f64>,
}

impl BackoffStrategy {
    pub(crate) const fn exponential(base: TimeDelta) -> Self {
        Self {
            base,
            max: None,
            jitter: None,
        }
    }

    /// Clamps the delay to `max_delay`, before jitter.
    pub(crate) const fn with_max(self, max_delay: TimeDelta) -> Self {
        Self {
            max: Some(max_delay),
            ..self
        }
    }

    /// Spread each delay by up to `ratio` of itself in either direction.
    pub(crate) const fn with_jitter(self, ratio: f64) -> Self {
        Self {
            jitter: Some(ratio),
            ..self
        }
    }

    /// The store backoff of a worker: starting at `poll_delay`, capped at `max_delay`.
    pub(crate) fn for_store(poll_delay: Duration, max_delay: Duration) -> Self {
        let base = TimeDelta::from_std(poll_delay).unwrap_or(TimeDelta::seconds(1));
        let max = TimeDelta::from_std(max_delay).unwrap_or(TimeDelta::seconds(30));
        Self::exponential(base).with_max(max).with_jitter(0.1)
    }

    /// Given the number of consecutive failures returns the [`TimeDelta`] to wait before trying
    /// again.
    pub(crate) fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1)).min(30);
        let mut backoff = self
            .base
            .checked_mul(1 << exponent)
            .unwrap_or(TimeDelta::MAX);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        match self.jitter {
            Some(ratio) => apply_jitter(backoff, ratio).max(TimeDelta::zero()),
            None => backoff,
        }
    }

    /// [`BackoffStrategy::backoff`] as a sleep duration.
    pub(crate) fn delay(&self, attempt: u16) -> Duration {
        self.backoff(attempt).to_std().unwrap_or_default()
    }
}

fn apply_jitter(value: TimeDelta, ratio: f64) -> TimeDelta {
    let milliseconds = (value.num_milliseconds() as f64 * ratio).round().abs() as i64;
    let rand_jitter_milliseconds = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
    value + TimeDelta::milliseconds(rand_jitter_milliseconds)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let base = TimeDelta::milliseconds(500);
        let strategy = BackoffStrategy::exponential(base);

        for i in 1..20 {
            assert_eq!(strategy.backoff(i), base * 2_i32.pow(u32::from(i) - 1));
        }
    }

    #[test]
    fn exponential_backoff_with_max() {
        let base = TimeDelta::milliseconds(500);
        let max = TimeDelta::seconds(30);
        let strategy = BackoffStrategy::exponential(base).with_max(max);

        assert_eq!(strategy.backoff(5), TimeDelta::seconds(8));
        for i in 1..u16::MAX {
            assert!(strategy.backoff(i) <= max);
        }
        assert_eq!(strategy.backoff(u16::MAX), max);
    }

    #[test]
    fn zeroth_attempt_is_base() {
        let base = TimeDelta::seconds(1);
        let strategy = BackoffStrategy::exponential(base);

        assert_eq!(strategy.backoff(0), base);
    }

    #[test]
    fn relative_jitter_stays_within_ratio() {
        let strategy = BackoffStrategy::exponential(TimeDelta::minutes(1)).with_jitter(0.1);

        for _ in 1..100 {
            let backoff = strategy.backoff(1);
            assert!(backoff >= TimeDelta::seconds(54));
            assert!(backoff <= TimeDelta::seconds(66));
        }
    }

    #[test]
    fn store_backoff_is_capped_with_jitter() {
        let strategy =
            BackoffStrategy::for_store(Duration::from_millis(500), Duration::from_secs(30));

        assert!(strategy.delay(1) >= Duration::from_millis(450));
        assert!(strategy.delay(1) <= Duration::from_millis(550));
        assert!(strategy.delay(40) <= Duration::from_secs(33));
        assert!(strategy.delay(40) >= Duration::from_secs(27));
    }
}
