//! Retry helpers for transient request failures.
//!
//! Page requests after the first go through [`with_retry`]: a transient
//! failure (timeout, connection reset, 429, 5xx, truncated body) is retried
//! after an exponential backoff, and the cancellation token is polled
//! before every new attempt. Permanent failures (4xx, exception reports)
//! are returned immediately.

use std::future::Future;
use std::time::Duration;

use geoharvest_feature_models::CancellationToken;

use crate::ServiceError;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// A single retry after `delay`.
    #[must_use]
    pub const fn once(delay: Duration) -> Self {
        Self {
            max_retries: 1,
            base_delay: delay,
        }
    }

    /// No retries at all.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation succeeded.
    Success {
        /// Returned value.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The operation failed permanently or ran out of retries.
    Failed {
        /// Last error observed.
        error: ServiceError,
        /// Attempts made.
        attempts: u32,
    },
    /// Cancellation was requested before a retry could start.
    Cancelled {
        /// Attempts made before cancelling.
        attempts: u32,
    },
}

/// Runs `op`, retrying transient failures according to `policy`.
///
/// `op` receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    token: &CancellationToken,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            log::warn!(
                "  retry {attempt}/{} for {label} in {delay:?}...",
                policy.max_retries
            );
            tokio::time::sleep(delay).await;
            if token.is_cancelled() {
                return RetryOutcome::Cancelled { attempts: attempt };
            }
        }

        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt + 1,
                };
            }
            Err(e) if is_transient(&e) && attempt < policy.max_retries => {
                log::warn!("  transient error on {label}: {e}");
                attempt += 1;
            }
            Err(error) => {
                return RetryOutcome::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }
        }
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
#[must_use]
pub fn is_transient(e: &ServiceError) -> bool {
    match e {
        ServiceError::Http(e) => {
            e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
        }
        ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
        ServiceError::MalformedResponse { .. } | ServiceError::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn server_error() -> ServiceError {
        ServiceError::Status {
            status: 503,
            url: "https://example.org/ows".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failure_once() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(
            RetryPolicy::once(Duration::ZERO),
            &CancellationToken::new(),
            "page 1",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(server_error())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: 1,
                attempts: 2
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_policy_is_exhausted() {
        let outcome: RetryOutcome<()> = with_retry(
            RetryPolicy::once(Duration::ZERO),
            &CancellationToken::new(),
            "page 1",
            |_| async { Err(server_error()) },
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let outcome: RetryOutcome<()> = with_retry(
            RetryPolicy::once(Duration::ZERO),
            &CancellationToken::new(),
            "page 1",
            |_| async {
                Err(ServiceError::Status {
                    status: 400,
                    url: String::new(),
                })
            },
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_before_retrying() {
        let token = CancellationToken::new();
        let outcome: RetryOutcome<()> = with_retry(
            RetryPolicy::once(Duration::ZERO),
            &token,
            "page 1",
            |_| {
                token.cancel();
                async { Err(server_error()) }
            },
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 1 }));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }
}
