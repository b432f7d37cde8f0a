//! Outbox configuration loaded from environment variables.
//!
//! Every knob has a default suitable for a phone on a flaky network, so the
//! outbox can start with zero configuration.

use std::time::Duration;

use parley_shared::constants::*;

use crate::error::{OutboxError, Result};
use crate::scheduler::RetryScheduler;

/// Tuning parameters of the delivery core.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Distinct entries that may be in flight at once.
    /// Env: `PARLEY_MAX_IN_FLIGHT`
    pub max_in_flight: usize,

    /// Send attempts before an entry is marked permanently failed.
    /// Env: `PARLEY_MAX_ATTEMPTS`
    pub max_attempts: u32,

    /// First retry delay.
    /// Env: `PARLEY_BACKOFF_BASE_MS`
    pub backoff_base: Duration,

    /// Cap on the exponential part of the retry delay.
    /// Env: `PARLEY_BACKOFF_CAP_MS`
    pub backoff_cap: Duration,

    /// Upper bound of the random jitter added to every delay.  Must stay
    /// below `backoff_base` so delays keep growing with the attempt count.
    /// Env: `PARLEY_BACKOFF_JITTER_MS`
    pub backoff_jitter: Duration,

    /// Bound on one send attempt (upload + create).  Expiry counts as a
    /// transient failure.
    /// Env: `PARLEY_SEND_TIMEOUT_SECS`
    pub send_timeout: Duration,

    /// Period of the coarse drain wake-up that honours `next_eligible_at`.
    /// Env: `PARLEY_WAKE_INTERVAL_SECS`
    pub wake_interval: Duration,

    /// Queued entries created longer ago than this are re-checked against the
    /// remote store at startup.  A tuning heuristic, not a correctness bound.
    /// Env: `PARLEY_STALE_AFTER_SECS`
    pub stale_after: Duration,

    /// Bound on the whole startup reconciliation pass.
    /// Env: `PARLEY_RECOVERY_TIMEOUT_SECS`
    pub recovery_timeout: Duration,

    /// Existence checks per entry before recovery falls back to `queued`.
    /// Env: `PARLEY_RECOVERY_ATTEMPTS`
    pub recovery_attempts: u32,

    /// Reachability probe period.
    /// Env: `PARLEY_PROBE_INTERVAL_SECS`
    pub probe_interval: Duration,

    /// Entries fetched per drain pass.
    pub drain_batch: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            backoff_jitter: Duration::from_millis(DEFAULT_BACKOFF_JITTER_MS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            wake_interval: Duration::from_secs(DEFAULT_WAKE_INTERVAL_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            recovery_timeout: Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS),
            recovery_attempts: DEFAULT_RECOVERY_ATTEMPTS,
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            drain_batch: 100,
        }
    }
}

impl OutboxConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Invalid number, using default");
                    None
                }
            }
        };

        if let Some(n) = number("PARLEY_MAX_IN_FLIGHT") {
            config.max_in_flight = n as usize;
        }
        if let Some(n) = number("PARLEY_MAX_ATTEMPTS") {
            config.max_attempts = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = number("PARLEY_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = number("PARLEY_BACKOFF_CAP_MS") {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(ms) = number("PARLEY_BACKOFF_JITTER_MS") {
            config.backoff_jitter = Duration::from_millis(ms);
        }
        if let Some(secs) = number("PARLEY_SEND_TIMEOUT_SECS") {
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = number("PARLEY_WAKE_INTERVAL_SECS") {
            config.wake_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = number("PARLEY_STALE_AFTER_SECS") {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = number("PARLEY_RECOVERY_TIMEOUT_SECS") {
            config.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = number("PARLEY_RECOVERY_ATTEMPTS") {
            config.recovery_attempts = n.min(u32::MAX as u64) as u32;
        }
        if let Some(secs) = number("PARLEY_PROBE_INTERVAL_SECS") {
            config.probe_interval = Duration::from_secs(secs);
        }

        config
    }

    /// Reject combinations the scheduler cannot honour.
    ///
    /// Jitter has to stay below every growth step of the deterministic
    /// delay, the partial step into the cap included.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(OutboxError::Config("max_in_flight must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(OutboxError::Config("max_attempts must be > 0".into()));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(OutboxError::Config(
                "backoff_cap must be >= backoff_base".into(),
            ));
        }
        if !self.backoff_jitter.is_zero() {
            let step = RetryScheduler::from_config(self).min_step();
            if self.backoff_jitter >= step {
                return Err(OutboxError::Config(format!(
                    "backoff_jitter must be smaller than the smallest backoff step ({}ms)",
                    step.as_millis()
                )));
            }
        }
        if self.send_timeout.is_zero() {
            return Err(OutboxError::Config("send_timeout must be > 0".into()));
        }
        if self.wake_interval.is_zero() || self.probe_interval.is_zero() {
            return Err(OutboxError::Config(
                "wake_interval and probe_interval must be > 0".into(),
            ));
        }
        if self.recovery_attempts == 0 {
            return Err(OutboxError::Config("recovery_attempts must be > 0".into()));
        }
        if self.drain_batch == 0 {
            return Err(OutboxError::Config("drain_batch must be > 0".into()));
        }
        Ok(())
    }
}
