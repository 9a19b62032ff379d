//! Retry policy for handler failures.
//!
//! The worker's retry loop asks the policy for the delay before the next
//! attempt; `None` stops retrying. Individual retry failures are not
//! persisted - only the final aggregated outcome is.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback form: `(attempt, error) -> Some(delay)` to retry after `delay`,
/// `None` to stop. `attempt` counts failures so far, 1-based.
pub type RetryDecider = Arc<dyn Fn(u32, &anyhow::Error) -> Option<Duration> + Send + Sync>;

/// When and how often a failing handler is re-attempted.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Fixed spacing, fixed retry budget. `retries` counts re-attempts after
    /// the initial one.
    Linear { retries: u32, delay: Duration },
    /// Arbitrary caller-supplied decision.
    Custom(RetryDecider),
}

impl RetryPolicy {
    /// Three retries, 500 ms apart.
    pub fn linear_default() -> Self {
        RetryPolicy::Linear { retries: 3, delay: Duration::from_millis(500) }
    }

    pub fn linear(retries: u32, delay: Duration) -> Self {
        RetryPolicy::Linear { retries, delay }
    }

    /// Fail immediately on the first error.
    pub fn never() -> Self {
        RetryPolicy::Linear { retries: 0, delay: Duration::ZERO }
    }

    pub fn custom<F>(decider: F) -> Self
    where
        F: Fn(u32, &anyhow::Error) -> Option<Duration> + Send + Sync + 'static,
    {
        RetryPolicy::Custom(Arc::new(decider))
    }

    /// Delay before the next attempt, or `None` when retries are exhausted.
    /// `attempt` is the number of failures so far (1 after the initial
    /// attempt failed).
    pub fn next_delay(&self, attempt: u32, error: &anyhow::Error) -> Option<Duration> {
        match self {
            RetryPolicy::Linear { retries, delay } => (attempt <= *retries).then_some(*delay),
            RetryPolicy::Custom(decider) => decider(attempt, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear_default()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Linear { retries, delay } => f
                .debug_struct("Linear")
                .field("retries", retries)
                .field("delay", delay)
                .finish(),
            RetryPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_three_linear_retries() {
        let policy = RetryPolicy::default();
        let err = anyhow::anyhow!("boom");
        assert_eq!(policy.next_delay(1, &err), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(3, &err), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(4, &err), None);
    }

    #[test]
    fn test_never_stops_immediately() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(RetryPolicy::never().next_delay(1, &err), None);
    }

    #[test]
    fn test_custom_decider_sees_attempt_and_error() {
        let policy = RetryPolicy::custom(|attempt, error| {
            if error.to_string().contains("transient") && attempt < 2 {
                Some(Duration::from_millis(10 * attempt as u64))
            } else {
                None
            }
        });

        let transient = anyhow::anyhow!("transient glitch");
        let fatal = anyhow::anyhow!("corrupt payload");
        assert_eq!(policy.next_delay(1, &transient), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2, &transient), None);
        assert_eq!(policy.next_delay(1, &fatal), None);
    }
}
