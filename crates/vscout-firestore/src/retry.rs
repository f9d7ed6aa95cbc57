//! Retry policy for Firestore requests.
//!
//! Retries transient failures (network, 429, 5xx) with capped exponential
//! backoff and full jitter. A server-provided Retry-After wins over the
//! computed delay.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::FirestoreResult;
use crate::metrics::record_retry;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Read `FIRESTORE_MAX_RETRIES`, `FIRESTORE_RETRY_BASE_MS` and
    /// `FIRESTORE_RETRY_MAX_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());

        let base_delay_ms = read("FIRESTORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay_ms);
        let max_delay_ms = read("FIRESTORE_RETRY_MAX_MS")
            .unwrap_or(defaults.max_delay_ms)
            .max(base_delay_ms);

        Self {
            max_retries: read("FIRESTORE_MAX_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_retries),
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        if let Some(after) = retry_after_ms {
            return Duration::from_millis(after);
        }

        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let jittered = (ceiling as f64 * jitter_fraction()) as u64;
        Duration::from_millis(jittered.max(self.base_delay_ms))
    }
}

/// Pseudo-random fraction in `[0, 1)` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Run `op`, retrying retryable errors per `config`.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, op: F) -> FirestoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = FirestoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for(attempt, e.retry_after_ms());
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Firestore request failed, retrying"
                );
                record_retry(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let delay = RetryConfig::default().delay_for(0, Some(2000));
        assert_eq!(delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_bounded_by_base_and_max() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 2000,
        };
        for attempt in [0, 1, 5, 40] {
            let delay = config.delay_for(attempt, None).as_millis();
            assert!((1000..=2000).contains(&delay), "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FirestoreError::ServerError(503, "busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: FirestoreResult<()> = with_retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FirestoreError::AlreadyExists("x".into()))
        })
        .await;
        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: FirestoreResult<()> = with_retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FirestoreError::RateLimited(1))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
