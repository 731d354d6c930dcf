//! In-process store implementations.
//!
//! Entries expire against the injected [`Clock`] rather than wall time.
//! Expired entries are removed when a read finds them, and
//! [`MemoryStore::sweep`] purges those nobody reads again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BlockRecord, CircuitBreakerStore, CorrelationStore, RateLimitStore, ScoreRecord};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::resilience::CircuitBreakerState;

#[derive(Debug, Clone, Copy)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Members of a sliding-window set, by last sighting.
#[derive(Debug)]
struct DistinctSet {
    members: HashMap<String, DateTime<Utc>>,
    window: Duration,
}

impl DistinctSet {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.window;
        self.members.retain(|_, seen| *seen > horizon);
    }
}

/// Upper bound on any TTL, roughly a century.
const MAX_TTL_SECS: i64 = 100 * 365 * 86_400;

fn ttl(seconds: u64) -> Duration {
    Duration::seconds(i64::try_from(seconds).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS))
}

/// Scores, blocks, distinct sets and watch flags held in `DashMap`s.
///
/// The store can be switched unavailable, after which every call fails with
/// [`StoreError::Unavailable`]; this drives the engine's degraded paths.
#[derive(Debug)]
pub struct MemoryStore {
    scores: DashMap<String, Expiring<ScoreRecord>>,
    blocks: DashMap<String, BlockRecord>,
    sets: DashMap<String, DistinctSet>,
    flags: DashMap<String, Expiring<i64>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            scores: DashMap::new(),
            blocks: DashMap::new(),
            sets: DashMap::new(),
            flags: DashMap::new(),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Toggle fault injection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether a live score or block is held under `key`.
    pub fn has_state_for(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.scores.get(key).is_some_and(|entry| entry.is_live(now))
            || self.blocks.get(key).is_some_and(|block| block.expires_at > now)
    }

    /// Number of scores, blocks, sets and flags currently held.
    pub fn len(&self) -> usize {
        self.scores.len() + self.blocks.len() + self.sets.len() + self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry and empty set. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.len();
        self.scores.retain(|_, entry| entry.is_live(now));
        self.blocks.retain(|_, block| block.expires_at > now);
        self.flags.retain(|_, flag| flag.is_live(now));
        self.sets.retain(|_, set| {
            set.prune(now);
            !set.members.is_empty()
        });
        before.saturating_sub(self.len())
    }

    /// Sweep every `period` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(live) = store.upgrade() else {
                    break;
                };
                let removed = live.sweep();
                if removed > 0 {
                    debug!(removed, remaining = live.len(), "Swept expired store entries");
                }
            }
        })
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.scores.clear();
        self.blocks.clear();
        self.sets.clear();
        self.flags.clear();
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ScoreRecord>> {
        self.ensure_available()?;
        let now = self.clock.now();
        self.scores.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(self
            .scores
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn increment(&self, key: &str, ttl_seconds: u64, delta: i64) -> StoreResult<i64> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut entry = self.scores.entry(key.to_string()).or_insert(Expiring {
            value: ScoreRecord {
                value: 0,
                updated_at: now,
            },
            expires_at: now,
        });
        if !entry.is_live(now) {
            entry.value.value = 0;
        }
        entry.value.value = entry.value.value.saturating_add(delta);
        entry.value.updated_at = now;
        entry.expires_at = now + ttl(ttl_seconds);
        trace!(delta, value = entry.value.value, "Score incremented");
        Ok(entry.value.value)
    }

    async fn check_block(&self, key: &str) -> StoreResult<Option<BlockRecord>> {
        self.ensure_available()?;
        let now = self.clock.now();
        self.blocks.remove_if(key, |_, block| block.expires_at <= now);
        Ok(self
            .blocks
            .get(key)
            .map(|block| *block)
            .filter(|block| block.expires_at > now))
    }

    async fn block(&self, key: &str, level: u32, duration_seconds: u64) -> StoreResult<()> {
        self.ensure_available()?;
        let expires_at = self.clock.now() + ttl(duration_seconds);
        self.blocks
            .insert(key.to_string(), BlockRecord { level, expires_at });
        Ok(())
    }

    async fn set(&self, key: &str, value: i64, ttl_seconds: u64) -> StoreResult<()> {
        self.ensure_available()?;
        let now = self.clock.now();
        self.scores.insert(
            key.to_string(),
            Expiring {
                value: ScoreRecord {
                    value,
                    updated_at: now,
                },
                expires_at: now + ttl(ttl_seconds),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CorrelationStore for MemoryStore {
    async fn add_distinct(
        &self,
        set_key: &str,
        member: &str,
        ttl_seconds: u64,
    ) -> StoreResult<u64> {
        self.ensure_available()?;
        let now = self.clock.now();
        let window = ttl(ttl_seconds);
        let mut set = self
            .sets
            .entry(set_key.to_string())
            .or_insert_with(|| DistinctSet {
                members: HashMap::new(),
                window,
            });
        set.window = window;
        set.prune(now);
        set.members.insert(member.to_string(), now);
        Ok(set.members.len() as u64)
    }

    async fn get_watch_flag(&self, key: &str) -> StoreResult<i64> {
        self.ensure_available()?;
        let now = self.clock.now();
        self.flags.remove_if(key, |_, flag| !flag.is_live(now));
        Ok(self
            .flags
            .get(key)
            .filter(|flag| flag.is_live(now))
            .map(|flag| flag.value)
            .unwrap_or(0))
    }

    async fn increment_watch_flag(&self, key: &str, ttl_seconds: u64) -> StoreResult<i64> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut flag = self.flags.entry(key.to_string()).or_insert(Expiring {
            value: 0,
            expires_at: now,
        });
        if !flag.is_live(now) {
            flag.value = 0;
            flag.expires_at = now + ttl(ttl_seconds);
        }
        flag.value = flag.value.saturating_add(1);
        Ok(flag.value)
    }

    async fn clear_watch_flag(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.flags.remove(key);
        Ok(())
    }
}

/// Circuit-breaker state held in a `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryCircuitBreakerStore {
    states: DashMap<String, CircuitBreakerState>,
}

impl MemoryCircuitBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitBreakerStore for MemoryCircuitBreakerStore {
    async fn load(&self, policy_name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        Ok(self.states.get(policy_name).map(|state| state.clone()))
    }

    async fn save(&self, policy_name: &str, state: &CircuitBreakerState) -> StoreResult<()> {
        self.states.insert(policy_name.to_string(), state.clone());
        Ok(())
    }
}
