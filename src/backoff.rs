use rand::Rng;
use std::time::Duration;

use crate::config::Config;
use crate::errors::AppError;

/// Exponential backoff with jitter, shared by the auth and match clients.
///
/// # Delay
///
/// `base * 2^attempt * (1 ± jitter_fraction)`, capped at `max_delay`.
///
/// # Retry decision
///
/// - **Retried**: timeouts, connection resets, HTTP 429 and 5xx.
/// - **Not retried**: any other 4xx, auth and validation failures.
/// - At most `max_attempts` attempts in total, the first one included.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_fraction: config.jitter_fraction,
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let unit = if self.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, unit)
    }

    /// Deterministic form of [`next_delay`](Self::next_delay); `unit` in [-1, 1]
    /// selects where in the jitter band the delay falls.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let growth = 2f64.powi(attempt.min(62) as i32);
        let jitter = 1.0 + self.jitter_fraction * unit.clamp(-1.0, 1.0);
        let raw = self.base_delay.as_secs_f64() * growth * jitter;
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Whether `err`, seen on attempt number `attempt` (1-based), deserves another try.
    pub fn should_retry(&self, err: &AppError, attempt: u32) -> bool {
        attempt < self.max_attempts && err.is_transient()
    }

    /// Wait before the attempt following `attempt`; a server `Retry-After` wins.
    pub fn retry_delay(&self, err: &AppError, attempt: u32) -> Duration {
        err.retry_after()
            .unwrap_or_else(|| self.next_delay(attempt.saturating_sub(1)))
    }
}

/// Parses a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
