//! Backoff strategies.
//!
//! Two schedules are used by the retry policies:
//!
//! - [`ExponentialBackoff`]: attempt 0 waits `min_backoff`; attempt `n >= 1`
//!   waits `min(2^(n-1) * delta_backoff, max_backoff)`.
//! - [`LinearBackoff`]: honours a server supplied `Retry-After` value
//!   (delta-seconds or HTTP date) but never waits less than its minimum.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default minimum exponential backoff.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(1000);

/// Default maximum exponential backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(4000);

/// Default exponential backoff step.
pub const DEFAULT_DELTA_BACKOFF: Duration = Duration::from_millis(2000);

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
}

impl ExponentialBackoff {
    /// Creates a schedule with explicit bounds.
    pub fn new(min_backoff: Duration, max_backoff: Duration, delta_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff,
            delta_backoff,
        }
    }

    /// Returns the delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.min_backoff;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.delta_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_MIN_BACKOFF,
            DEFAULT_MAX_BACKOFF,
            DEFAULT_DELTA_BACKOFF,
        )
    }
}

/// Linear backoff driven by the `Retry-After` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    minimum_delay: Duration,
}

impl LinearBackoff {
    /// Creates a schedule that never waits less than `minimum_delay`.
    pub fn new(minimum_delay: Duration) -> Self {
        Self { minimum_delay }
    }

    /// Returns the configured floor.
    pub fn minimum_delay(&self) -> Duration {
        self.minimum_delay
    }

    /// Computes the delay for an optional `Retry-After` value.
    pub fn delay(&self, retry_after: Option<&str>) -> Duration {
        self.delay_at(retry_after, Utc::now())
    }

    /// Computes the delay relative to `now`.
    pub fn delay_at(&self, retry_after: Option<&str>, now: DateTime<Utc>) -> Duration {
        let Some(value) = retry_after.map(str::trim).filter(|v| !v.is_empty()) else {
            return self.minimum_delay;
        };

        if let Ok(seconds) = value.parse::<u64>() {
            return self.minimum_delay.max(Duration::from_secs(seconds));
        }

        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            let millis = (date.with_timezone(&Utc) - now).num_milliseconds();
            // A date in the past yields a negative delta; the floor applies.
            let until = Duration::from_millis(u64::try_from(millis).unwrap_or(0));
            return self.minimum_delay.max(until);
        }

        self.minimum_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_exponential_default_schedule() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_exponential_saturates_on_huge_attempts() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(40), Duration::from_millis(4000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(4000));
    }

    #[test]
    fn test_exponential_custom_bounds() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(50),
            Duration::from_millis(1000),
            Duration::from_millis(100),
        );
        assert_eq!(backoff.delay(0), Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_retry_after_seconds() {
        let backoff = LinearBackoff::new(Duration::from_millis(1000));
        assert_eq!(backoff.delay(Some("120")), Duration::from_secs(120));
        assert!(backoff.delay(Some(" 120 ")) >= Duration::from_millis(120_000));
    }

    #[test]
    fn test_linear_retry_after_below_minimum() {
        let backoff = LinearBackoff::new(Duration::from_millis(10_000));
        assert_eq!(backoff.delay(Some("0")), Duration::from_millis(10_000));
        assert_eq!(backoff.delay(Some("3")), Duration::from_millis(10_000));
    }

    #[test]
    fn test_linear_retry_after_http_date() {
        let backoff = LinearBackoff::new(Duration::from_millis(1000));
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let delay = backoff.delay_at(Some("Wed, 21 Oct 2015 07:28:00 GMT"), now);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_linear_retry_after_past_date_uses_minimum() {
        let backoff = LinearBackoff::new(Duration::from_millis(1500));
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let delay = backoff.delay_at(Some("Wed, 21 Oct 2015 07:28:00 GMT"), now);
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_linear_unparseable_uses_minimum() {
        let backoff = LinearBackoff::new(Duration::from_millis(1000));
        assert_eq!(backoff.delay(None), Duration::from_millis(1000));
        assert_eq!(backoff.delay(Some("")), Duration::from_millis(1000));
        assert_eq!(backoff.delay(Some("soon")), Duration::from_millis(1000));
        assert_eq!(backoff.delay(Some("-5")), Duration::from_millis(1000));
    }
}
