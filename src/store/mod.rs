//! Counter storage backends.
//!
//! The admission algorithms never touch counter state directly; they ask a
//! [`CounterStore`] to perform one atomic read-modify-write per check. Two
//! implementations exist: [`LocalStore`] keeps state in process memory behind
//! per-key locks, and [`RedisStore`] keeps it in Redis and runs every
//! operation as a single server-side script.

mod distributed;
mod local;

pub use distributed::RedisStore;
pub use local::{CounterEntry, LocalStore};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::{FixedWindow, SlidingOutcome};

/// Default key namespace, shared by both stores.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Errors raised by counter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Unexpected store response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether the error says the store itself is unreachable, as opposed to
    /// a failure confined to one key or one reply.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            StoreError::Protocol(_) => false,
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shape of a bucket: its capacity and its refill or drain rate per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub rate: f64,
}

/// Result of a bucket operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Level after the operation
    pub level: f64,
}

/// Counter key for a rule and identifier: `{ruleName}:{identifier}`.
pub fn counter_key(rule_name: &str, identifier: &str) -> String {
    format!("{}:{}", rule_name, identifier)
}

/// Atomic counter operations backing the admission algorithms.
///
/// Every method is a single atomic step for its key. Calls for different
/// keys must not serialize on each other.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Add `cost` to the count for `key` in `window` and return the new count.
    async fn incr_fixed(
        &self,
        key: &str,
        cost: u64,
        window: FixedWindow,
        now_ms: u64,
    ) -> StoreResult<u64>;

    /// Expire events older than the window, then record `cost` events at
    /// `now_ms` if the log stays within `limit`.
    async fn record_sliding(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        cost: u64,
    ) -> StoreResult<SlidingOutcome>;

    /// Refill the token bucket for `key`, then take `cost` tokens if available.
    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome>;

    /// Drain the leaky bucket for `key`, then add `cost` if it fits.
    async fn fill_leaky(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome>;

    /// Evict entries whose TTL has passed. Returns how many were removed.
    async fn purge_expired(&self, now_ms: u64) -> StoreResult<usize>;

    /// Check that the store is reachable.
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
