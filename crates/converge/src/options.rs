//! Convergence knobs, with `KEEL_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use keel_schedule::ScheduleOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergeOptions {
    pub schedule: ScheduleOptions,
    /// Total tries per node for transient failures, first try included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Wall-clock budget for one `converge`/`teardown` call.
    pub deadline: Duration,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            schedule: ScheduleOptions::default(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_ceiling: Duration::from_secs(10),
            deadline: Duration::from_secs(600),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

impl ConvergeOptions {
    /// Defaults overridden by `KEEL_MAX_CONCURRENT_APPLIES`, `KEEL_APPLY_TIMEOUT_MS`,
    /// `KEEL_MAX_ATTEMPTS`, `KEEL_BACKOFF_BASE_MS`, `KEEL_BACKOFF_CEILING_MS`
    /// and `KEEL_CONVERGE_DEADLINE_SECS`. Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            schedule: ScheduleOptions {
                max_concurrent_applies: env_or("KEEL_MAX_CONCURRENT_APPLIES", d.schedule.max_concurrent_applies).max(1),
                apply_timeout: Duration::from_millis(env_or("KEEL_APPLY_TIMEOUT_MS", d.schedule.apply_timeout.as_millis() as u64)),
            },
            max_attempts: env_or("KEEL_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff_base: Duration::from_millis(env_or("KEEL_BACKOFF_BASE_MS", d.backoff_base.as_millis() as u64)),
            backoff_ceiling: Duration::from_millis(env_or("KEEL_BACKOFF_CEILING_MS", d.backoff_ceiling.as_millis() as u64)),
            deadline: Duration::from_secs(env_or("KEEL_CONVERGE_DEADLINE_SECS", d.deadline.as_secs())),
        }
    }

    /// Delay before try `attempt + 1`: `base * 2^(attempt-1)`, capped at the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_ceiling)
    }
}
