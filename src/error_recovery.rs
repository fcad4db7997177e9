//! Retry policies for flaky query exchanges.
//
// Instruments occasionally answer a query with stale output left behind by an
// earlier command (a prompt, an echoed value). Query helpers retry those
// exchanges a bounded number of times after flushing the transport.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// `retryable` decides whether a given error is worth another attempt; any
/// other error is returned immediately. The last error is returned when every
/// attempt failed.
pub async fn retry_with<T, E, F, Fut>(
    policy: &RetryPolicy,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                debug!(attempt, max_attempts = attempts, "retrying after failed attempt");
                attempt += 1;
                if !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        };
        let result: Result<u32, String> = retry_with(
            &policy,
            |_| true,
            |n| {
                attempts.set(n);
                async move {
                    if n >= 2 {
                        Ok(n)
                    } else {
                        Err("garbled".to_string())
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::ZERO,
        };
        let result: Result<(), String> = retry_with(
            &policy,
            |_| true,
            |n| {
                attempts.set(n);
                async { Err("garbled".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let attempts = Cell::new(0);
        let result: Result<(), &str> = retry_with(
            &RetryPolicy::default(),
            |e| *e != "fatal",
            |n| {
                attempts.set(n);
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.get(), 1);
    }
}
