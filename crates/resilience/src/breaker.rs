use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::executor::ExecuteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing; calls are rejected without doing any work.
    Open,
    /// Probing whether the service recovered.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long to stay open before probing.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// A three-state breaker for one logical service.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open → half-open timeout transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force the breaker back to closed, clearing counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        tracing::info!(breaker = %self.name, "circuit breaker reset to closed");
    }

    /// Run `op` under breaker protection. While open, returns
    /// [`ExecuteError::Open`] immediately and `op` is never invoked.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            self.refresh(&mut inner);
            if inner.state == BreakerState::Open {
                inner.total_rejections += 1;
                return Err(ExecuteError::Open(self.name.clone()));
            }
        }

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(ExecuteError::Inner(err))
            }
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner.last_failure.map(|at| at.elapsed());
            if elapsed.is_some_and(|e| e >= self.config.open_duration) {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
                tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    tracing::info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!(breaker = %self.name, "circuit breaker reopened from half-open");
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn breaker(failure_threshold: u32, open_duration: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "peer-1",
            BreakerConfig {
                failure_threshold,
                success_threshold: 2,
                open_duration,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), ExecuteError<String>> {
        b.execute(|| async { Err::<(), _>("timeout".to_string()) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), ExecuteError<String>> {
        b.execute(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test]
    async fn opens_on_kth_consecutive_failure_and_not_before() {
        let b = breaker(3, Duration::from_secs(60));

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), BreakerState::Closed);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), BreakerState::Open);

        // Rejected without running the operation.
        let rejected = b
            .execute(|| async {
                panic!("must not run");
                #[allow(unreachable_code)]
                Ok::<(), String>(())
            })
            .await;
        assert!(matches!(rejected, Err(ExecuteError::Open(_))));
        assert_eq!(b.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let b = breaker(3, Duration::from_secs(60));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let b = breaker(1, Duration::from_millis(20));
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_millis(20));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
