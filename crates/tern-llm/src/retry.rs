//! Bounded retry for provider calls.
//!
//! Transient failures (429 except quota exhaustion, 5xx, transport
//! errors, timeouts) are retried at most [`RetryConfig::max_attempts`]
//! times with a backoff of `base_delay * attempt`.

use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

/// Retry behavior configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call.
    pub max_attempts: u32,

    /// Base delay; attempt `n` (1-indexed) waits `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(350),
        }
    }
}

/// Whether a provider error is worth retrying.
pub fn is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited { .. } => true,
        ProviderError::Timeout => true,
        ProviderError::Http(_) => true,
        ProviderError::RequestFailed(msg) => {
            msg.starts_with("HTTP 500")
                || msg.starts_with("HTTP 502")
                || msg.starts_with("HTTP 503")
                || msg.starts_with("HTTP 504")
        }
        ProviderError::AuthFailed(_)
        | ProviderError::NotConfigured(_)
        | ProviderError::InvalidResponse(_)
        | ProviderError::Json(_) => false,
    }
}

/// Delay before retry attempt `attempt` (1-indexed).
///
/// Rate-limit responses that suggest a longer wait win over the
/// computed backoff.
pub fn retry_delay(config: &RetryConfig, attempt: u32, err: &ProviderError) -> Duration {
    let computed = config.base_delay.saturating_mul(attempt.max(1));
    if let ProviderError::RateLimited { retry_after_ms } = err {
        return computed.max(Duration::from_millis(*retry_after_ms));
    }
    computed
}

/// Run `op` with bounded retry on transient errors.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !is_retryable(&err) || attempt > config.max_attempts {
                    return Err(err);
                }
                let delay = retry_delay(config, attempt, &err);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn rate_limited_is_retryable() {
        assert!(is_retryable(&ProviderError::RateLimited {
            retry_after_ms: 100
        }));
    }

    #[test]
    fn server_errors_retryable_client_errors_not() {
        assert!(is_retryable(&ProviderError::RequestFailed(
            "HTTP 503 Service Unavailable: upstream".into()
        )));
        assert!(!is_retryable(&ProviderError::RequestFailed(
            "HTTP 400 Bad Request: bad tool schema".into()
        )));
        assert!(!is_retryable(&ProviderError::AuthFailed("nope".into())));
    }

    #[test]
    fn delay_scales_with_attempt() {
        let config = RetryConfig::default();
        let err = ProviderError::Timeout;
        assert_eq!(retry_delay(&config, 1, &err), Duration::from_millis(350));
        assert_eq!(retry_delay(&config, 2, &err), Duration::from_millis(700));
        assert_eq!(retry_delay(&config, 3, &err), Duration::from_millis(1050));
    }

    #[test]
    fn rate_limit_suggestion_wins_when_larger() {
        let config = RetryConfig::default();
        let err = ProviderError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(retry_delay(&config, 1, &err), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn with_retry_recovers_after_transient_failure() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result = with_retry(&config, || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(ProviderError::Timeout)
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_budget() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&config, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(ProviderError::Timeout) }
        })
        .await;
        assert!(result.is_err());
        // Initial call + 2 retries.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn with_retry_fails_fast_on_permanent_error() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&config, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(ProviderError::AuthFailed("invalid key".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
