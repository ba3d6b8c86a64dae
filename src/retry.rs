//! Retry decisions for failed stage attempts.
//!
//! The policy is a pure function of the failure class and the attempt count;
//! the scheduler turns a `RetryAfter` into a `not_before` timestamp on the task
//! instead of sleeping.

use crate::config::SchedulerSettings;
use crate::error::ErrorClass;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Capped exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_cap_ms),
        )
    }

    /// Decide after a failure with `retry_count` retries already spent.
    ///
    /// Transient failures wait `min(base * 2^retry_count, cap)` while budget
    /// remains. Permanent and cancelled failures are never retried.
    pub fn decide(&self, class: ErrorClass, retry_count: u32, max_retries: u32) -> RetryDecision {
        match class {
            ErrorClass::Permanent | ErrorClass::Cancelled => RetryDecision::Fail,
            ErrorClass::Transient if retry_count >= max_retries => RetryDecision::Fail,
            ErrorClass::Transient => RetryDecision::RetryAfter(self.delay(retry_count)),
        }
    }

    /// Backoff before retry number `retry_count + 1`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(600))
    }

    #[test]
    fn test_transient_backoff_doubles() {
        let p = policy();
        let base = Duration::from_secs(30);
        assert_eq!(p.decide(ErrorClass::Transient, 0, 3), RetryDecision::RetryAfter(base));
        assert_eq!(p.decide(ErrorClass::Transient, 1, 3), RetryDecision::RetryAfter(base * 2));
        assert_eq!(p.decide(ErrorClass::Transient, 2, 3), RetryDecision::RetryAfter(base * 4));
        assert_eq!(p.decide(ErrorClass::Transient, 3, 3), RetryDecision::Fail);
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay(5), Duration::from_secs(600));
        assert_eq!(p.delay(40), Duration::from_secs(600));
    }

    #[test]
    fn test_permanent_and_cancelled_never_retry() {
        let p = policy();
        assert_eq!(p.decide(ErrorClass::Permanent, 0, 3), RetryDecision::Fail);
        assert_eq!(p.decide(ErrorClass::Cancelled, 0, 3), RetryDecision::Fail);
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        assert_eq!(policy().decide(ErrorClass::Transient, 0, 0), RetryDecision::Fail);
    }
}
