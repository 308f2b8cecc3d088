//! Retry with exponential backoff for capability calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::CapabilityError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): doubles each time, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `call` until it succeeds or attempts run out.
    ///
    /// Each attempt is bounded by `timeout`; an elapsed timeout counts as a
    /// failed attempt. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        capability: &'static str,
        timeout: Duration,
        mut call: F,
    ) -> Result<T, CapabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => CapabilityError::Timeout {
                    capability,
                    seconds: timeout.as_secs(),
                },
            };

            if attempt >= attempts {
                return Err(error);
            }

            let delay = self.backoff(attempt);
            warn!(
                capability,
                attempt,
                max_attempts = attempts,
                "{} (retrying in {:?})",
                error,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn transport(message: &str) -> CapabilityError {
        CapabilityError::Transport {
            capability: "reflector",
            message: message.to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
        assert_eq!(policy.backoff(64), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast(3)
            .run("reflector", Duration::from_secs(1), || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(transport("connection reset"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = fast(3)
            .run("reflector", Duration::from_secs(1), || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(transport(&format!("failure {}", n))) }
            })
            .await;

        assert_eq!(result, Err(transport("failure 2")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_an_attempt() {
        let result: Result<(), _> = fast(2)
            .run("curator", Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(
            result,
            Err(CapabilityError::Timeout {
                capability: "curator",
                seconds: 0
            })
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let _ = RetryPolicy { max_attempts: 0, ..fast(1) }
            .run("reflector", Duration::from_secs(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transport("x")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
