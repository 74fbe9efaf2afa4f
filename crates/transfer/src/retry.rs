use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry bound and exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The cancellation token fired during an attempt or a backoff wait.
    Cancelled,
    /// The last attempt failed (either out of retries or not retryable).
    Failed { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    /// Returns the last failure, if any.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Failed { source, .. } => Some(source),
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given retry (1-based): 1s, 2s, 4s, ... capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. `op` receives the 1-based attempt number.
    ///
    /// An in-flight attempt is dropped as soon as `cancel` fires.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        is_retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                r = op(attempt) => r,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= max_attempts || !is_retryable(&err) {
                warn!(attempt, error = %err, "giving up");
                return Err(RetryError::Failed {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for_retry(attempt);
            debug!(
                attempt,
                delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                error = %err,
                "attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
