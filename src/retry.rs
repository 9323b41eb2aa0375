//! Retry policies for transient infrastructure failures.
//!
//! Two policies are kept apart on purpose: data failures (broker down,
//! deserialization hiccup) follow an exponential [`RetryDelay`], while
//! authentication failures wait a fixed interval and never consume the data
//! retry budget.

use std::future::Future;
use std::time::Duration;

use crate::delay::RetryDelay;
use crate::error::{Error, FailureClass};

/// How many times an operation may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// Give up after this many attempts (the first try included).
    Bounded(u32),
    /// Keep trying; blocks the partition until the failure clears.
    Unbounded,
}

impl Attempts {
    fn allows(&self, attempts_made: u32) -> bool {
        match self {
            Attempts::Bounded(max) => attempts_made < *max,
            Attempts::Unbounded => true,
        }
    }
}

/// Policy for transient data-path failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    delay: RetryDelay,
    attempts: Attempts,
}

impl RetryPolicy {
    pub fn new(delay: RetryDelay, attempts: Attempts) -> Self {
        Self { delay, attempts }
    }

    pub fn bounded(delay: RetryDelay, max_attempts: u32) -> Result<Self, Error> {
        if max_attempts == 0 {
            return Err(Error::invalid_config(
                "max_attempts",
                "max_attempts cannot be 0",
            ));
        }
        Ok(Self::new(delay, Attempts::Bounded(max_attempts)))
    }

    pub fn unbounded(delay: RetryDelay) -> Self {
        Self::new(delay, Attempts::Unbounded)
    }

    pub fn delay(&self) -> RetryDelay {
        self.delay
    }

    pub fn attempts(&self) -> Attempts {
        self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryDelay::exponential(1_000, 2.0, 30_000), Attempts::Bounded(3))
    }
}

/// Fixed-interval policy for authentication-adjacent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRetryPolicy {
    interval: Duration,
}

impl AuthRetryPolicy {
    pub fn new(interval: Duration) -> Result<Self, Error> {
        if interval.is_zero() {
            return Err(Error::invalid_config(
                "auth_retry_interval",
                "auth_retry_interval cannot be 0",
            ));
        }
        Ok(Self { interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for AuthRetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or `policy` gives up.
///
/// Transient errors are retried with backoff and count against the policy;
/// authentication errors wait `auth.interval()` and are not counted. Permanent
/// and fatal errors are returned immediately. When a bounded policy is exhausted
/// the last error is wrapped in [`Error::RetriesExhausted`].
///
/// Cancelling the returned future (e.g. on shutdown) abandons any pending sleep.
pub async fn retry<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    auth: &AuthRetryPolicy,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempts = 0u32;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match error.class() {
            FailureClass::Permanent | FailureClass::Fatal => return Err(error),
            FailureClass::Authentication => {
                tracing::warn!(
                    operation = what,
                    %error,
                    interval_ms = auth.interval().as_millis() as u64,
                    "authentication failure, retrying after fixed interval"
                );
                tokio::time::sleep(auth.interval()).await;
            }
            FailureClass::Transient => {
                attempts += 1;
                if !policy.attempts().allows(attempts) {
                    return Err(Error::RetriesExhausted {
                        attempts,
                        source: Box::new(error),
                    });
                }
                let delay = policy.delay().calculate_delay(attempts - 1);
                tracing::warn!(
                    operation = what,
                    %error,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryDelay {
        RetryDelay::exponential(1, 2.0, 5)
    }

    fn fast_auth() -> AuthRetryPolicy {
        AuthRetryPolicy::new(Duration::from_millis(1)).unwrap()
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::bounded(fast(), 5).unwrap();

        let result = retry("test", &policy, &fast_auth(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("broker unavailable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_policy_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::bounded(fast(), 3).unwrap();

        let result: Result<(), Error> = retry("test", &policy, &fast_auth(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::transient("still down"))
            }
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::TransientInfra { .. }));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::unbounded(fast());

        let result: Result<(), Error> = retry("test", &policy, &fast_auth(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::precondition("NOPE"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Precondition { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authentication_failures_do_not_consume_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::bounded(fast(), 1).unwrap();

        let result = retry("test", &policy, &fast_auth(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err(Error::Authentication {
                        message: "token expired".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn policies_validate_inputs() {
        match RetryPolicy::bounded(fast(), 0) {
            Err(Error::InvalidConfig { message, parameter }) => {
                assert_eq!(message, "max_attempts cannot be 0");
                assert_eq!(parameter, Some("max_attempts".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }
        assert!(AuthRetryPolicy::new(Duration::ZERO).is_err());
        assert_eq!(
            AuthRetryPolicy::default().interval(),
            Duration::from_secs(30)
        );
    }
}
