//! Bounded retry with exponential backoff and jitter.
//!
//! Before retry number `n` (1-based) the caller's task sleeps for
//! `base_delay * 2^(n-1) * (0.5 + 0.5 * jitter)` with `jitter` in `[0, 1)`.
//! The terminal failure is always handed back; deciding whether to swallow
//! it is the caller's business.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Source of the jitter fraction in `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always the same jitter. Handy for reproducible delays.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// How many times to retry and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, before jitter
    pub base_delay: Duration,
    jitter: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Build from config values (`base_delay_secs` must be positive).
    pub fn from_secs(max_retries: u32, base_delay_secs: f64) -> Self {
        let base_delay = Duration::try_from_secs_f64(base_delay_secs)
            .unwrap_or_else(|_| Duration::from_secs(2));
        Self::new(max_retries, base_delay)
    }

    /// Replace the jitter source.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `attempt` (1-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        scale(self.base_delay, 2f64.powi(exponent))
    }

    /// Delay before retry `attempt` with the given jitter fraction applied.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        scale(self.base_delay_for(attempt), 0.5 + 0.5 * jitter)
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Details of a failed attempt that is about to be retried.
#[derive(Debug)]
pub struct RetryNotice<'a, E> {
    /// Retry number, starting at 1
    pub attempt: u32,
    pub base_delay: Duration,
    pub delay: Duration,
    pub error: &'a E,
}

/// Every allowed attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("failed after {attempts} attempt(s): {last}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

/// Call `call` until it succeeds or the policy is exhausted.
///
/// `on_retry` sees every scheduled retry before the sleep starts. It cannot
/// change what happens next.
pub async fn retry_with_backoff<T, E, F, Fut, H>(
    policy: &RetryPolicy,
    mut call: F,
    mut on_retry: H,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: FnMut(&RetryNotice<'_, E>),
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempts <= policy.max_retries => {
                let attempt = attempts;
                let delay = policy.delay_for(attempt, policy.jitter.sample());
                on_retry(&RetryNotice {
                    attempt,
                    base_delay: policy.base_delay_for(attempt),
                    delay,
                    error: &error,
                });
                tokio::time::sleep(delay).await;
            }
            Err(last) => return Err(RetryError { attempts, last }),
        }
    }
}
