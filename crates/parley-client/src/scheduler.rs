//! Retry timing.
//!
//! `backoff(n) = min(cap, base * 2^(n-1)) + random(0..=jitter)` for the
//! `n`-th failed attempt.  With `jitter` below every step of the
//! deterministic part (see [`RetryScheduler::min_step`]) the delay is
//! strictly increasing in `n` up to and including the first capped attempt.
//! Attempts past that all draw from `cap + random(0..=jitter)`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::OutboxConfig;

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    base: Duration,
    cap: Duration,
    jitter: Duration,
    max_attempts: u32,
}

impl RetryScheduler {
    pub fn new(base: Duration, cap: Duration, jitter: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            jitter,
            max_attempts,
        }
    }

    pub fn from_config(config: &OutboxConfig) -> Self {
        Self::new(
            config.backoff_base,
            config.backoff_cap,
            config.backoff_jitter,
            config.max_attempts,
        )
    }

    /// Deterministic part of the delay after `attempt` failures.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.cap)
    }

    /// Smallest growth of [`base_delay`](Self::base_delay) between two
    /// consecutive attempts, up to the first one that reaches the cap.
    pub(crate) fn min_step(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let mut smallest = self.base;
        let mut attempt = 1;
        while attempt < self.max_attempts {
            let current = self.base_delay(attempt);
            if current >= self.cap {
                break;
            }
            let step = self.base_delay(attempt + 1).saturating_sub(current);
            if !step.is_zero() {
                smallest = smallest.min(step);
            }
            attempt += 1;
        }
        smallest
    }

    /// Full delay after `attempt` failures, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        base.saturating_add(Duration::from_millis(extra))
    }

    pub fn next_eligible_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now.checked_add_signed(delay).unwrap_or(now)
    }

    /// Whether `attempts` failures use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(
            Duration::from_millis(1000),
            Duration::from_millis(60_000),
            Duration::from_millis(500),
            8,
        )
    }

    #[test]
    fn base_delay_doubles_up_to_cap() {
        let s = scheduler();
        assert_eq!(s.base_delay(1), Duration::from_secs(1));
        assert_eq!(s.base_delay(2), Duration::from_secs(2));
        assert_eq!(s.base_delay(3), Duration::from_secs(4));
        assert_eq!(s.base_delay(7), Duration::from_secs(60));
        assert_eq!(s.base_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_monotonic_below_cap() {
        let s = scheduler();
        // Max of one step must stay below the min of the next.
        for n in 1..6 {
            let upper = s.base_delay(n) + Duration::from_millis(500);
            assert!(upper < s.base_delay(n + 1), "attempt {n}");
        }
        for _ in 0..200 {
            let a = s.backoff(3);
            let b = s.backoff(4);
            assert!(a < b);
        }
    }

    #[test]
    fn jitter_is_bounded() {
        let s = scheduler();
        for _ in 0..500 {
            let d = s.backoff(2);
            assert!(d >= Duration::from_millis(2000));
            assert!(d <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn min_step_shrinks_at_the_cap() {
        let s = RetryScheduler::new(
            Duration::from_millis(1000),
            Duration::from_millis(1500),
            Duration::ZERO,
            8,
        );
        assert_eq!(s.min_step(), Duration::from_millis(500));
        assert_eq!(scheduler().min_step(), scheduler().base_delay(1));
    }

    #[test]
    fn delays_increase_through_first_capped_attempt() {
        let s = RetryScheduler::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            Duration::from_millis(49),
            8,
        );
        assert!(s.min_step() > Duration::from_millis(49));
        for _ in 0..50 {
            let delays: Vec<_> = (1..=3).map(|n| s.backoff(n)).collect();
            assert!(delays[0] < delays[1] && delays[1] < delays[2], "{delays:?}");
        }
    }

    #[test]
    fn exhausted_at_ceiling() {
        let s = scheduler();
        assert!(!s.exhausted(7));
        assert!(s.exhausted(8));
    }

    #[test]
    fn next_eligible_is_in_the_future() {
        let s = scheduler();
        let now = Utc::now();
        assert!(s.next_eligible_at(1, now) >= now + chrono::Duration::seconds(1));
    }
}
