//! Rate limiting.
//!
//! Two token buckets share one algorithm: [`TokenBucket`] keeps its state in
//! process memory; [`DistributedTokenBucket`] executes the same refill step
//! atomically on an external key-value store so that many processes share
//! one budget.

pub mod distributed;
pub mod token_bucket;

use async_trait::async_trait;

pub use distributed::{BucketArgs, BucketDecision, BucketStore, DistributedTokenBucket, MemoryBucketStore};
pub use token_bucket::TokenBucket;

use crate::error::LimiterError;

/// Admission control over a replenishing token budget.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take `permits` tokens.
    ///
    /// Returns `Ok(false)` when the bucket cannot satisfy the request right
    /// now; the tokens already taken by others keep replenishing at the
    /// configured rate.
    ///
    /// # Errors
    /// Returns [`LimiterError`] when the backing store fails.
    async fn acquire(&self, permits: u64) -> Result<bool, LimiterError>;
}
