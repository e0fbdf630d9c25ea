//! Retryable call abstraction shared by connectors.
//!
//! A call is retried only when the caller-supplied predicate accepts the
//! error; everything else is returned immediately. The final error after the
//! last attempt is returned unchanged.

use std::future::Future;
use std::time::Duration;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Sleep before each retry.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `operation` until it succeeds, returns a non-retryable error, or
    /// `max_attempts` is reached.
    pub async fn run<F, Fut, T, P>(&self, should_retry: P, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&crate::Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= max_attempts || !should_retry(&e) {
                        return Err(e);
                    }
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %e,
                        "retrying call"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
