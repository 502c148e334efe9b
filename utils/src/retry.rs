//! Bounded retries for optimistic read-compute-write loops.
//!
//! [`RetryPolicy::run`] calls an attempt closure until it succeeds, fails
//! with an error the caller classifies as permanent, or the retry budget is
//! spent. The two failure modes are reported separately so callers can turn
//! an exhausted budget into their own first-class error.

use std::time::Duration;

use tracing::{debug, warn};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// No delay; retry immediately.
    None,
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error that must not be retried.
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts = 1 + `max_retries`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub async fn run<T, E, F, Fut, R>(
        &self,
        description: &str,
        mut attempt_fn: F,
        mut is_retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: FnMut(&E) -> bool,
    {
        let mut delay = self.backoff.initial_delay();
        let mut attempt = 0;

        loop {
            let err = match attempt_fn(attempt).await {
                Ok(val) => return Ok(val),
                Err(e) => e,
            };
            if !is_retryable(&err) {
                debug!(description, attempt, error = %err, "permanent failure, not retrying");
                return Err(RetryError::Permanent(err));
            }
            if attempt == self.max_retries {
                warn!(
                    description,
                    attempts = attempt + 1,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }
            debug!(
                description,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            delay = self.backoff.next_delay(delay);
            attempt += 1;
        }
    }
}
