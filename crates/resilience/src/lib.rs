//! Bounded retries and per-service circuit breaking for outbound calls.
//!
//! [`RetryPolicy`] re-runs a fallible operation with a configurable delay
//! strategy; [`CircuitBreaker`] fails fast once a peer keeps failing; and
//! [`ResilientExecutor`] composes the two with the breaker on the outside,
//! so one exhausted retry sequence counts as a single breaker failure.

mod breaker;
mod executor;

pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
pub use executor::{ExecuteError, ResilientExecutor};

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Always `initial_delay`.
    Fixed,
    /// `initial_delay * attempt`.
    Linear,
    /// `initial_delay * multiplier^(attempt - 1)`.
    Exponential,
    /// Exponential, scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
    #[default]
    ExponentialJitter,
    /// `fib(attempt) * initial_delay`.
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub strategy: RetryStrategy,
    /// Substring patterns marking an error as retryable. An error whose
    /// rendering matches none of them is not retried, even with attempts
    /// remaining.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            strategy: RetryStrategy::default(),
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn retry_on(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_errors.push(pattern.into());
        self
    }

    pub fn is_retryable(&self, error: &str) -> bool {
        self.retryable_errors.iter().any(|p| error.contains(p))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after `attempt` failures, before attempt `attempt + 1`.
    /// `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay;
        let delay = match self.config.strategy {
            RetryStrategy::Fixed => initial,
            RetryStrategy::Linear => initial.saturating_mul(attempt),
            RetryStrategy::Exponential => exponential(initial, self.config.multiplier, attempt),
            RetryStrategy::ExponentialJitter => {
                let base = exponential(initial, self.config.multiplier, attempt);
                let jitter = self.config.jitter.clamp(0.0, 1.0);
                if jitter > 0.0 {
                    use rand::Rng;
                    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
                    base.mul_f64(factor)
                } else {
                    base
                }
            }
            RetryStrategy::Fibonacci => {
                // fib(1) = fib(2) = 1.
                let (mut prev, mut fib) = (1u32, 1u32);
                for _ in 2..attempt {
                    let next = fib.saturating_add(prev);
                    prev = fib;
                    fib = next;
                }
                initial.saturating_mul(fib)
            }
        };
        delay.min(self.config.max_delay)
    }

    /// Run `op` until it succeeds, its error is not retryable, or
    /// `max_attempts` is reached. The last error propagates unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let rendered = err.to_string();
                    if !self.config.is_retryable(&rendered) {
                        tracing::debug!(error = %rendered, "error is not retryable");
                        return Err(err);
                    }
                    if attempt >= self.config.max_attempts {
                        tracing::warn!(
                            attempt,
                            error = %rendered,
                            "retry attempts exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %rendered,
                        "attempt failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn exponential(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
    let secs = initial.as_secs_f64() * factor;
    if secs.is_finite() && secs < Duration::MAX.as_secs_f64() {
        Duration::from_secs_f64(secs)
    } else {
        Duration::MAX
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            strategy,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            multiplier: 2.0,
            jitter: 0.5,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn delay_strategies() {
        let ms = Duration::from_millis;

        let fixed = policy(RetryStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), ms(100));
        assert_eq!(fixed.delay_for(5), ms(100));

        let linear = policy(RetryStrategy::Linear);
        assert_eq!(linear.delay_for(1), ms(100));
        assert_eq!(linear.delay_for(3), ms(300));
        assert_eq!(linear.delay_for(9), ms(450), "capped at max_delay");

        let exp = policy(RetryStrategy::Exponential);
        assert_eq!(exp.delay_for(1), ms(100));
        assert_eq!(exp.delay_for(2), ms(200));
        assert_eq!(exp.delay_for(3), ms(400));
        assert_eq!(exp.delay_for(4), ms(450), "capped at max_delay");

        let fib = policy(RetryStrategy::Fibonacci);
        assert_eq!(fib.delay_for(1), ms(100));
        assert_eq!(fib.delay_for(2), ms(100));
        assert_eq!(fib.delay_for(3), ms(200));
        assert_eq!(fib.delay_for(4), ms(300));
        assert_eq!(fib.delay_for(5), ms(450), "fib(5)=5, capped");

        let jittered = policy(RetryStrategy::ExponentialJitter);
        for _ in 0..32 {
            let d = jittered.delay_for(2);
            assert!(d >= ms(100) && d <= ms(300), "jittered delay {d:?}");
        }
    }

    #[tokio::test]
    async fn single_attempt_calls_exactly_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 1,
            retryable_errors: vec!["timeout".to_string()],
            ..RetryConfig::default()
        });

        let out: Result<(), String> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unlisted_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            retryable_errors: vec!["timeout".to_string()],
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        });

        let out: Result<(), String> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("access denied".to_string()) }
            })
            .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            strategy: RetryStrategy::Fixed,
            initial_delay: Duration::from_millis(1),
            retryable_errors: vec!["timeout".to_string()],
            ..RetryConfig::default()
        });

        let out: Result<u32, String> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
