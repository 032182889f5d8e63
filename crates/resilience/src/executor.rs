use std::future::Future;

use crate::{BreakerConfig, CircuitBreaker, RetryConfig, RetryPolicy};

/// Error from a breaker-protected call.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    /// Rejected without doing any work; resolves automatically once the
    /// open duration elapses and probes succeed.
    #[error("service temporarily unavailable: circuit open for {0}")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

impl<E> ExecuteError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            ExecuteError::Open(_) => None,
            ExecuteError::Inner(err) => Some(err),
        }
    }
}

/// Retry policy and circuit breaker for one logical service, composed so
/// the retry loop runs inside the breaker: however many attempts the
/// policy makes, the breaker observes a single success or failure.
#[derive(Debug)]
pub struct ResilientExecutor {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientExecutor {
    pub fn new(name: impl Into<String>, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        let name = name.into();
        Self {
            retry: RetryPolicy::new(retry),
            breaker: CircuitBreaker::new(name, breaker),
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.breaker.execute(move || self.retry.execute(op)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{BreakerState, RetryStrategy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn executor(max_attempts: u32, failure_threshold: u32) -> ResilientExecutor {
        ResilientExecutor::new(
            "peer-1",
            RetryConfig {
                max_attempts,
                strategy: RetryStrategy::Fixed,
                initial_delay: Duration::from_millis(1),
                retryable_errors: vec!["timeout".to_string()],
                ..RetryConfig::default()
            },
            BreakerConfig {
                failure_threshold,
                ..BreakerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn retry_exhaustion_counts_once_against_the_breaker() {
        let exec = executor(3, 2);
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;

        assert!(matches!(out, Err(ExecuteError::Inner(_))));
        // Three inner attempts, one breaker failure.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = exec.breaker().stats();
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_skips_the_retry_loop() {
        let exec = executor(3, 1);

        let _: Result<(), _> = exec
            .execute(|| async { Err("timeout".to_string()) })
            .await;
        assert_eq!(exec.breaker().state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let out: Result<(), _> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;

        assert!(matches!(out, Err(ExecuteError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inner_success_after_retry_is_a_breaker_success() {
        let exec = executor(3, 5);
        let calls = AtomicU32::new(0);

        let out = exec
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 1);
        let stats = exec.breaker().stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 0);
    }
}
