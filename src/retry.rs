// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Wait-and-retry with exponential backoff, used when connecting and on every
//! publish path. The wait before retry `n` (1-based) is `base^n` seconds.

use std::{future::Future, time::Duration};
use tokio::time::sleep;

/// Backoff base of the publish retry policy.
pub const PUBLISH_BACKOFF_BASE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    retries: u32,
    base: f64,
}

impl RetryPolicy {
    /// `retries` attempts after the first one, waiting `base^attempt` seconds
    /// before each of them.
    pub fn exponential(retries: u32, base: f64) -> Self {
        Self { retries, base }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Wait before the given retry, 1-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self.base.powi(attempt.min(i32::MAX as u32) as i32);
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    /// Runs `op` until it succeeds, returns a non retryable error, or the
    /// retries are exhausted. The last error is returned as is.
    ///
    /// `on_retry` receives the error, the wait and the retry number before
    /// every wait.
    pub async fn execute<T, E, F, Fut, R, L>(
        &self,
        mut op: F,
        retryable: R,
        mut on_retry: L,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        L: FnMut(&E, Duration, u32),
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries && retryable(&err) => {
                    attempt += 1;
                    let wait = self.delay(attempt);
                    on_retry(&err, wait, attempt);
                    sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::exponential(3, PUBLISH_BACKOFF_BASE);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));

        let connect = RetryPolicy::exponential(5, 1.2);
        assert!((connect.delay(2).as_secs_f64() - 1.44).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3, PUBLISH_BACKOFF_BASE);

        let result: Result<u32, &str> = policy
            .execute(
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("unreachable")
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
                |_, _, _| {},
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_after_retries() {
        let calls = &AtomicU32::new(0);
        let mut waits = vec![];
        let policy = RetryPolicy::exponential(2, PUBLISH_BACKOFF_BASE);

        let result: Result<(), u32> = policy
            .execute(
                move || async move { Err(calls.fetch_add(1, Ordering::SeqCst)) },
                |_| true,
                |_, wait, _| waits.push(wait),
            )
            .await;

        assert_eq!(result, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(waits, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5, PUBLISH_BACKOFF_BASE);

        let result: Result<(), &str> = policy
            .execute(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("not found")
                },
                |_| false,
                |_, _, _| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
