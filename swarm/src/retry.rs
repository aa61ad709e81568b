//! Bounded retry with exponential backoff for flaky agent calls.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, is_cancellation};

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th failure (1-indexed).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Successful value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` until it succeeds, `classify` rejects the error, or the policy is exhausted.
///
/// `op` receives the 1-indexed attempt number. Cancellation is never retried and
/// interrupts backoff sleeps. The last error is returned with the attempt count
/// attached as context, so typed errors remain reachable via `downcast_ref`.
pub fn retry_with_backoff<T, C, F>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    classify: C,
    mut op: F,
) -> Result<Retried<T>>
where
    C: Fn(&anyhow::Error) -> RetryDecision,
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        attempt += 1;
        let err = match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) => err,
        };

        if is_cancellation(&err) || classify(&err) == RetryDecision::Fail {
            return Err(err.context(format!("{label} failed on attempt {attempt}")));
        }
        if attempt >= max_attempts {
            return Err(err.context(format!("{label} gave up after {attempt} attempt(s)")));
        }

        let delay = policy.delay_after(attempt);
        warn!(
            label,
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            err = %format!("{err:#}"),
            "transient failure; retrying"
        );
        cancel.sleep(delay)?;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::cancel::Cancelled;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    impl std::error::Error for Flaky {}

    fn classify(err: &anyhow::Error) -> RetryDecision {
        match err.downcast_ref::<Flaky>() {
            Some(Flaky(true)) => RetryDecision::Retry,
            _ => RetryDecision::Fail,
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn succeeds_after_transient_failures_within_budget() {
        let calls = Cell::new(0);
        let out = retry_with_backoff("agent", &fast(3), &CancelToken::new(), classify, |n| {
            calls.set(n);
            if n < 3 {
                Err(Flaky(true).into())
            } else {
                Ok("done")
            }
        })
        .expect("third attempt succeeds");

        assert_eq!(out.value, "done");
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_when_budget_is_exhausted() {
        let calls = Cell::new(0);
        let err = retry_with_backoff("agent", &fast(2), &CancelToken::new(), classify, |n| {
            calls.set(n);
            if n < 3 {
                Err::<(), _>(Flaky(true).into())
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        assert_eq!(calls.get(), 2);
        assert!(err.to_string().contains("gave up after 2 attempt(s)"));
        assert!(err.downcast_ref::<Flaky>().is_some());
    }

    #[test]
    fn non_retryable_error_fails_immediately() {
        let calls = Cell::new(0);
        let err = retry_with_backoff("agent", &fast(5), &CancelToken::new(), classify, |n| {
            calls.set(n);
            Err::<(), _>(Flaky(false).into())
        })
        .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(err.to_string().contains("failed on attempt 1"));
    }

    #[test]
    fn cancelled_token_stops_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = retry_with_backoff("agent", &fast(5), &cancel, classify, |_| Ok(()))
            .unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn cancellation_inside_op_is_not_retried() {
        let calls = Cell::new(0);
        let err = retry_with_backoff("agent", &fast(5), &CancelToken::new(), |_| RetryDecision::Retry, |n| {
            calls.set(n);
            Err::<(), _>(Cancelled.into())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(is_cancellation(&err));
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(3000));
        assert_eq!(policy.delay_after(3), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }
}
