//! Token bucket shared across processes through a key-value store.
//!
//! The bucket keeps two sibling keys in the store: `<key>` holds the current
//! token count and `<key>.ts` the whole-second timestamp of the last refill.
//! Both carry a TTL of `floor(2 * capacity / rate)` seconds so abandoned
//! buckets evaporate. The refill-and-consume step must run atomically on the
//! store; [`BucketStore`] is that seam, and [`MemoryBucketStore`] implements
//! the reference semantics in process for tests and single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::RateLimiter;
use crate::error::LimiterError;

/// Inputs of one atomic refill-and-consume step.
#[derive(Debug, Clone, Copy)]
pub struct BucketArgs {
    /// Tokens replenished per second.
    pub rate: f64,
    /// Maximum token count.
    pub capacity: u64,
    /// Caller clock in whole seconds since the epoch.
    pub now_s: u64,
    /// Tokens requested.
    pub requested: u64,
}

/// Outcome of one atomic refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Token count stored after the step.
    pub tokens: u64,
}

/// Store executing the refill-and-consume step atomically server-side.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Run one step for the bucket at `key`.
    ///
    /// Missing keys read as a full bucket with a zero timestamp; both keys
    /// are rewritten with the TTL described in the module docs.
    ///
    /// # Errors
    /// Returns [`LimiterError::Store`] when the store is unreachable or the
    /// step cannot run atomically.
    async fn refill_and_consume(
        &self,
        key: &str,
        args: BucketArgs,
    ) -> Result<BucketDecision, LimiterError>;
}

/// Token bucket whose budget lives in a shared store.
pub struct DistributedTokenBucket {
    store: Arc<dyn BucketStore>,
    key: String,
    capacity: u64,
    rate: f64,
}

impl DistributedTokenBucket {
    /// Create a bucket at `key` with `capacity` tokens refilling at `rate`
    /// tokens per second.
    #[must_use]
    pub fn new(store: Arc<dyn BucketStore>, key: impl Into<String>, capacity: u64, rate: f64) -> Self {
        Self {
            store,
            key: key.into(),
            capacity,
            rate,
        }
    }

    fn now_s() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimiter for DistributedTokenBucket {
    async fn acquire(&self, permits: u64) -> Result<bool, LimiterError> {
        let decision = self
            .store
            .refill_and_consume(
                &self.key,
                BucketArgs {
                    rate: self.rate,
                    capacity: self.capacity,
                    now_s: Self::now_s(),
                    requested: permits,
                },
            )
            .await?;
        Ok(decision.allowed)
    }
}

/// In-process [`BucketStore`] with the reference refill semantics.
#[derive(Default)]
pub struct MemoryBucketStore {
    entries: tokio::sync::Mutex<HashMap<String, StoredValue>>,
}

#[derive(Debug, Clone, Copy)]
struct StoredValue {
    value: u64,
    expires_at: Instant,
}

impl MemoryBucketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

fn live_value(entries: &HashMap<String, StoredValue>, key: &str, now: Instant) -> Option<u64> {
    entries
        .get(key)
        .and_then(|stored| (stored.expires_at > now).then_some(stored.value))
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        args: BucketArgs,
    ) -> Result<BucketDecision, LimiterError> {
        if args.rate <= 0.0 {
            return Err(LimiterError::Store("rate must be positive".into()));
        }
        let timestamp_key = format!("{key}.ts");
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let last_tokens = live_value(&entries, key, now).unwrap_or(args.capacity);
        let last_refreshed = live_value(&entries, &timestamp_key, now).unwrap_or(0);

        let delta = args.now_s.saturating_sub(last_refreshed);
        let filled = (last_tokens as f64 + delta as f64 * args.rate)
            .min(args.capacity as f64)
            .floor()
            .max(0.0) as u64;
        let allowed = filled >= args.requested;
        let tokens = if allowed {
            filled - args.requested
        } else {
            filled
        };

        let ttl_s = ((2.0 * args.capacity as f64) / args.rate).floor().max(0.0) as u64;
        let expires_at = now + Duration::from_secs(ttl_s);
        entries.insert(
            key.to_owned(),
            StoredValue {
                value: tokens,
                expires_at,
            },
        );
        entries.insert(
            timestamp_key,
            StoredValue {
                value: args.now_s,
                expires_at,
            },
        );
        Ok(BucketDecision { allowed, tokens })
    }
}
