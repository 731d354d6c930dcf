//! Per-key rolling budget counters.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::store::RateLimitStore;

/// Tracks consumption of a per-key budget.
#[async_trait]
pub trait BudgetTracker: Send + Sync {
    /// Whether the key has consumed at least `threshold` units.
    async fn is_exceeded(&self, key: &str, threshold: i64) -> StoreResult<bool>;

    /// Consume one unit; returns the new total.
    async fn increment(&self, key: &str) -> StoreResult<i64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTrackerConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

fn default_window() -> u64 {
    3600
}

impl Default for BudgetTrackerConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
        }
    }
}

/// Budget counters kept as `budget:<key>` scores in the rate-limit store.
pub struct StoreBudgetTracker {
    store: Arc<dyn RateLimitStore>,
    config: BudgetTrackerConfig,
}

impl StoreBudgetTracker {
    pub fn new(store: Arc<dyn RateLimitStore>, config: BudgetTrackerConfig) -> Self {
        Self { store, config }
    }

    fn counter_key(key: &str) -> String {
        format!("budget:{}", key)
    }
}

#[async_trait]
impl BudgetTracker for StoreBudgetTracker {
    async fn is_exceeded(&self, key: &str, threshold: i64) -> StoreResult<bool> {
        let used = self
            .store
            .get(&Self::counter_key(key))
            .await?
            .map_or(0, |record| record.value);
        Ok(used >= threshold)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.store
            .increment(&Self::counter_key(key), self.config.window_secs, 1)
            .await
    }
}
