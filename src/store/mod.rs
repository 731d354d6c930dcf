//! Backing store contracts consumed by the engine.
//!
//! The engine only needs a narrow set of atomic primitives from its stores.
//! Any key/value engine with TTL support can provide them; [`memory`] holds
//! the in-process implementations used by the binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::resilience::CircuitBreakerState;

pub use memory::{MemoryCircuitBreakerStore, MemoryStore};

/// A stored abuse score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub value: i64,
    pub updated_at: DateTime<Utc>,
}

/// An active block on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub level: u32,
    pub expires_at: DateTime<Utc>,
}

/// Scores, blocks and small scalar values.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch a score, or `None` if absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<ScoreRecord>>;

    /// Atomically add `delta` to a score, refresh its TTL and return the new value.
    async fn increment(&self, key: &str, ttl_seconds: u64, delta: i64) -> StoreResult<i64>;

    /// Fetch the active block on a key, if any.
    async fn check_block(&self, key: &str) -> StoreResult<Option<BlockRecord>>;

    /// Create or overwrite a block on a key.
    async fn block(&self, key: &str, level: u32, duration_seconds: u64) -> StoreResult<()>;

    /// Overwrite a score with an absolute value.
    async fn set(&self, key: &str, value: i64, ttl_seconds: u64) -> StoreResult<()>;
}

/// Distinct-member sets and short-lived watch counters used by the
/// correlation heuristics.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Add `member` to a sliding-window set and return the set's cardinality.
    async fn add_distinct(&self, set_key: &str, member: &str, ttl_seconds: u64)
        -> StoreResult<u64>;

    /// Current value of a watch counter, `0` if absent or expired.
    async fn get_watch_flag(&self, key: &str) -> StoreResult<i64>;

    /// Increment a watch counter, creating it with `ttl_seconds` if absent.
    async fn increment_watch_flag(&self, key: &str, ttl_seconds: u64) -> StoreResult<i64>;

    /// Remove a watch counter.
    async fn clear_watch_flag(&self, key: &str) -> StoreResult<()>;
}

/// Persistence for per-policy circuit-breaker state.
#[async_trait]
pub trait CircuitBreakerStore: Send + Sync {
    async fn load(&self, policy_name: &str) -> StoreResult<Option<CircuitBreakerState>>;

    async fn save(&self, policy_name: &str, state: &CircuitBreakerState) -> StoreResult<()>;
}
