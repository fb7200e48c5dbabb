//! Minimum-interval rate limiting for refresh attempts.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A constant-time rate limiter ensuring at least `min_interval` between
/// granted permits. Exactly one permit passes per interval window.
///
/// Waiting is done by rescheduling on the timer after the remaining delay
/// and re-checking, never by spinning; a waiter that loses the re-check race
/// simply sleeps again for the new remainder.
#[derive(Debug)]
pub struct AsyncRateLimiter {
    min_interval: Duration,
    next_permit_at: Mutex<Option<Instant>>,
}

impl AsyncRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_permit_at: Mutex::new(None),
        }
    }

    /// Returns the delay before the next permit may be granted, claiming the
    /// permit when the delay is zero.
    fn next_delay(&self, now: Instant) -> Duration {
        let mut next = self.next_permit_at.lock().unwrap();
        match *next {
            Some(at) if at > now => at - now,
            _ => {
                // Allow exactly one operation past this timestamp.
                *next = Some(now + self.min_interval);
                Duration::ZERO
            }
        }
    }

    /// Resolve once a permit has been granted.
    pub async fn acquire(&self) {
        loop {
            let delay = self.next_delay(Instant::now());
            if delay.is_zero() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let limiter = AsyncRateLimiter::new(Duration::from_millis(1000));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_waits_full_interval() {
        let limiter = AsyncRateLimiter::new(Duration::from_millis(1000));
        limiter.acquire().await;
        let first_done = Instant::now();
        limiter.acquire().await;
        assert!(Instant::now() - first_done >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_permit_per_window() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(AsyncRateLimiter::new(Duration::from_millis(1000)));
        let granted = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            tasks.push(tokio::spawn(async move {
                limiter.acquire().await;
                granted.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // First window: exactly one waiter through.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(granted.load(Ordering::SeqCst), 1);

        // Each elapsed interval admits one more.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(granted.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(granted.load(Ordering::SeqCst), 3);

        for task in tasks {
            task.await.unwrap();
        }
    }
}
