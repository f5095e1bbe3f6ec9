//! In-process token bucket.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use super::RateLimiter;
use crate::error::LimiterError;

#[derive(Debug)]
struct BucketState {
    consumed_tokens: u64,
    last_refresh_ms: u64,
}

/// Token bucket replenishing `rate` tokens per millisecond up to `capacity`.
///
/// The refresh bookkeeping keeps the slice of elapsed time too small to mint
/// a whole token, so slow drips are not rounded away; a capacity lowered at
/// runtime clamps the consumed count instead of underflowing.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    rate: f64,
    epoch: Instant,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket with `capacity` tokens refilling at `rate` tokens per
    /// millisecond.
    #[must_use]
    pub fn new(capacity: u64, rate: f64) -> Self {
        Self {
            capacity,
            rate,
            epoch: Instant::now(),
            state: Mutex::new(BucketState {
                consumed_tokens: 0,
                last_refresh_ms: 0,
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Try to take `permits` tokens without waiting.
    #[must_use]
    pub fn try_acquire(&self, permits: u64) -> bool {
        let now_ms = self.now_ms();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let elapsed = now_ms.saturating_sub(state.last_refresh_ms);
        let minted = (elapsed as f64 * self.rate).floor().max(0.0) as u64;
        let spent_ms = if self.rate > 0.0 {
            (minted as f64 / self.rate).floor() as u64
        } else {
            elapsed
        };
        // keep the time slice that did not mint a whole token
        state.last_refresh_ms = now_ms - elapsed.saturating_sub(spent_ms);

        state.consumed_tokens = state.consumed_tokens.min(self.capacity);
        state.consumed_tokens = state.consumed_tokens.saturating_sub(minted);

        match state.consumed_tokens.checked_add(permits) {
            Some(total) if total <= self.capacity => {
                state.consumed_tokens = total;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, permits: u64) -> Result<bool, LimiterError> {
        Ok(self.try_acquire(permits))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn consumes_and_refills() {
        let bucket = TokenBucket::new(10, 1.0);
        assert!(bucket.try_acquire(9));
        assert!(!bucket.try_acquire(9));
        std::thread::sleep(Duration::from_millis(3));
        assert!(bucket.try_acquire(2));
    }

    #[test]
    fn oversized_requests_never_pass() {
        let bucket = TokenBucket::new(4, 1.0);
        assert!(!bucket.try_acquire(5));
        assert!(bucket.try_acquire(4));
    }

    #[test]
    fn successful_acquire_reduces_headroom() {
        // A refill-free bucket: rate zero keeps the arithmetic exact.
        let bucket = TokenBucket::new(100, 0.0);
        assert!(bucket.try_acquire(40));
        assert!(bucket.try_acquire(60));
        assert!(!bucket.try_acquire(1));
    }

    #[tokio::test]
    async fn trait_object_form_works() {
        let limiter: Box<dyn RateLimiter> = Box::new(TokenBucket::new(2, 1.0));
        assert_eq!(limiter.acquire(1).await.expect("no store"), true);
    }
}
