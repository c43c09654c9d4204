// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policies
//!
//! Two backoff shapes are used by the bus:
//! - [`RetryPolicy::Forever`] waits the same delay between attempts and never
//!   gives up. The connection supervisor uses it.
//! - [`RetryPolicy::Exponential`] allows a fixed number of extra attempts and
//!   waits `base^k` seconds before retry `k`. The publisher uses it with
//!   `retries = 5` and `base = 2`, i.e. 2s, 4s, 8s, 16s, 32s.
//!
//! Only transient errors ([`AmqpError::is_transient`]) are retried; anything else
//! is returned to the caller on the first occurrence.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tracing::warn;

/// Number of extra publish attempts after the first one fails.
pub const PUBLISH_RETRY_COUNT: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryPolicy {
    Forever { delay: Duration },
    Exponential { retries: u32, base: f64 },
}

impl RetryPolicy {
    pub fn forever(delay: Duration) -> Self {
        RetryPolicy::Forever { delay }
    }

    pub fn exponential(retries: u32) -> Self {
        RetryPolicy::Exponential { retries, base: 2.0 }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the policy
    /// is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Forever { delay } => Some(delay),
            RetryPolicy::Exponential { retries, base } => {
                if attempt == 0 || attempt > retries {
                    return None;
                }

                let secs = base.powi(attempt.min(i32::MAX as u32) as i32);
                Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
            }
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// policy runs out of retries. The last error is returned on exhaustion.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AmqpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.delay(attempt) else {
                        return Err(err);
                    };

                    warn!(
                        error = err.to_string(),
                        operation,
                        attempt,
                        "{} failed, retrying in {:.1}s",
                        operation,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{ready, Ready};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use tokio::time::Instant;

    /// Fails with a socket error for the first `failures` calls.
    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> Ready<Result<u32, AmqpError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                ready(Err(AmqpError::SocketError("reset".into())))
            } else {
                ready(Ok(n))
            }
        }
    }

    #[test]
    fn exponential_delays_double_until_exhausted() {
        let policy = RetryPolicy::exponential(PUBLISH_RETRY_COUNT);

        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(32)));
        assert_eq!(policy.delay(6), None);
    }

    #[test]
    fn forever_never_runs_out() {
        let policy = RetryPolicy::forever(Duration::from_secs(15));

        for attempt in [1, 10, 10_000, u32::MAX] {
            assert_eq!(policy.delay(attempt), Some(Duration::from_secs(15)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_retries_min_of_failures_and_five() {
        for failures in 0..=8u32 {
            let calls = Arc::new(AtomicU32::new(0));
            let started = Instant::now();

            let result = RetryPolicy::exponential(PUBLISH_RETRY_COUNT)
                .execute("publish", flaky(failures, calls.clone()))
                .await;

            let retries = failures.min(PUBLISH_RETRY_COUNT);
            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);

            let expected: u64 = (1..=retries).map(|k| 2u64.pow(k)).sum();
            assert_eq!(started.elapsed().as_secs(), expected);

            if failures > PUBLISH_RETRY_COUNT {
                assert_eq!(result, Err(AmqpError::SocketError("reset".into())));
            } else {
                assert_eq!(result, Ok(failures + 1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forever_keeps_waiting_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = RetryPolicy::forever(Duration::from_secs(15))
            .execute("connect", flaky(40, calls.clone()))
            .await;

        assert_eq!(result, Ok(41));
        assert_eq!(started.elapsed().as_secs(), 15 * 40);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AmqpError> = RetryPolicy::forever(Duration::from_secs(1))
            .execute("connect", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AmqpError::ConnectionError) }
            })
            .await;

        assert_eq!(result, Err(AmqpError::ConnectionError));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
