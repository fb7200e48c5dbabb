//! Jittered exponential retry for control-plane calls.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

const GOLDEN_RATIO: f64 = 1.618;
const BASE_DELAY_MS: f64 = 200.0;

/// Retries a fallible async operation with jittered exponential backoff.
///
/// The sleep before retry attempt `i` (0-indexed) is
/// `200ms * 1.618^(i + 1 + U)` with `U` uniform in `[0, 1)`, spreading
/// retries across many instances so a control-plane outage does not produce
/// synchronized reconnect storms.
///
/// By default every failure is fatal (no retry); callers opt in by passing a
/// predicate identifying retryable failures, as the control-plane call sites
/// do with [`api_client_is_fatal`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffRetry {
    max_attempts: u32,
}

impl Default for BackoffRetry {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl BackoffRetry {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "max_attempts must be > 0");
        Self { max_attempts }
    }

    /// Run `op`, treating every failure as fatal.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with(op, |_| true).await
    }

    /// Run `op`, retrying failures for which `is_fatal` returns false.
    pub async fn call_with<T, F, Fut>(
        &self,
        mut op: F,
        is_fatal: impl Fn(&Error) -> bool,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_fatal(&e) || attempt + 1 >= self.max_attempts {
                        return Err(e);
                    }
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                    let exponent = f64::from(attempt) + 1.0 + jitter;
                    let sleep = Duration::from_millis(
                        (BASE_DELAY_MS * GOLDEN_RATIO.powf(exponent)) as u64,
                    );
                    tracing::debug!(
                        attempt,
                        sleep_ms = sleep.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(sleep).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Fatality predicate for control-plane API calls: only failures the
/// repository classified as transient (network errors, 5xx responses) get
/// another attempt.
pub fn api_client_is_fatal(e: &Error) -> bool {
    !e.is_retryable()
}
