//! Process-wide token bucket for outbound generation calls.
//!
//! One shared instance gates every generation call regardless of which job
//! or worker issues it — the aggregate of many concurrent jobs must not trip
//! the upstream provider's rate limit.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket rate limiter.
///
/// `capacity` tokens maximum, `refill` tokens added per `refill_interval`.
/// [`acquire`](Self::acquire) cooperatively sleeps until a token is
/// available; the lock is never held across an await point.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill: u32, refill_interval: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        let refill_per_sec = f64::from(refill.max(1)) / refill_interval.as_secs_f64().max(1e-9);

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec,
        }
    }

    /// Acquire one token, waiting cooperatively if none is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                // Time until one full token has accumulated.
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Try to acquire one token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current whole tokens available.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::new(5, 5, Duration::from_secs(1));

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(2, 2, Duration::from_secs(1));

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // 2 tokens per second: after 500ms exactly one is back.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let limiter = RateLimiter::new(1, 1, Duration::from_secs(1));

        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // The second acquire had to wait about a full refill interval.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(3, 3, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 3);
    }
}
