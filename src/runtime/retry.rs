//! Explicit retry policy applied at call sites that talk to the broker or the
//! store: bounded attempts, capped exponential backoff, and a caller-supplied
//! classifier deciding which errors are worth another attempt.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DEFAULT_INITIAL_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries until the operation succeeds or the token is cancelled.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = next_backoff(delay, self.max_delay);
        }
        delay.min(self.max_delay)
    }

    fn exhausted(&self, attempt: usize) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, the classifier aborts, the policy is
/// exhausted, or `cancellation` fires. `on_retry` sees every failure that will
/// be followed by another attempt.
pub async fn retry_with_policy<T, E, F, Fut, C, L>(
    policy: RetryPolicy,
    cancellation: Option<&CancellationToken>,
    mut operation: F,
    mut classify: C,
    mut on_retry: L,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryDisposition,
    L: FnMut(usize, Duration, &E),
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(RetryError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if classify(&err) == RetryDisposition::Abort || policy.exhausted(attempt) {
            return Err(RetryError::Failed { attempts: attempt, source: err });
        }

        let delay = policy.delay_for(attempt);
        on_retry(attempt, delay, &err);
        if sleep_with_cancellation(delay, cancellation).await.is_err() {
            return Err(RetryError::Cancelled);
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Failed { attempts: usize, source: E },
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Failed { source, .. } => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Failed { attempts, source } => {
                write!(f, "gave up after {attempts} attempt(s): {source}")
            }
            RetryError::Cancelled => write!(f, "retry cancelled"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Sleeps for `delay`, returning early with an error if `cancellation` fires.
pub async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("sleep cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
