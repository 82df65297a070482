//! Retry with exponential backoff for transient transfer failures
//!
//! Only [`SyncError::TransientTransfer`] is retried. Anything else returns
//! immediately; exhausting the attempts turns the last transient error into
//! [`SyncError::TransferExhausted`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Minimal delays, for tests
    #[must_use]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    /// Grow `delay` by `factor`, capped at `max_delay`. Factors that would
    /// shrink or overflow the delay leave it at the cap.
    fn next_delay(&self, delay: Duration) -> Duration {
        if self.factor.is_nan() || self.factor < 1.0 {
            return delay.min(self.max_delay);
        }
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor)
            .map_or(self.max_delay, |next| next.min(self.max_delay))
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancel` fires.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let err = match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    debug!(operation = operation_name, retries = attempts, "succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if err.is_transient() => err,
            Err(err) => return Err(err),
        };

        attempts += 1;
        if attempts >= config.max_attempts {
            warn!(operation = operation_name, attempts, error = %err, "giving up");
            return Err(SyncError::TransferExhausted {
                operation: operation_name.to_string(),
                attempts,
                last: err.to_string(),
            });
        }

        warn!(
            operation = operation_name,
            attempt = attempts,
            max = config.max_attempts,
            error = %err,
            "transient failure, retrying in {delay:?}"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let cancel = CancellationToken::new();
        let value = retry("op", &RetryConfig::fast(3), &cancel, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = retry("op", &RetryConfig::fast(5), &cancel, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::transient("op", "reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry("put_block", &RetryConfig::fast(3), &cancel, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::transient("put_block", "timeout"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::TransferExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry("get_block", &RetryConfig::fast(5), &cancel, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::integrity("block", "bad digest"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Integrity { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_delay_survives_bad_factors() {
        let base = RetryConfig::fast(3);
        let delay = Duration::from_millis(2);
        assert_eq!(base.next_delay(delay), Duration::from_millis(4));
        assert_eq!(base.next_delay(Duration::from_millis(4)), Duration::from_millis(5));

        for factor in [-1.0, f64::NAN, f64::INFINITY, f64::MAX] {
            let config = RetryConfig { factor, ..base.clone() };
            assert!(config.next_delay(delay) <= config.max_delay, "factor {factor}");
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            factor: 1.0,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = retry("op", &config, &cancel, || async {
            Err::<(), _>(SyncError::transient("op", "down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
