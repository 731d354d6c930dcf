//! Anti-equilibrium gate.
//!
//! An attacker can sit just under the hard-block line and absorb soft blocks
//! indefinitely. Repeated soft blocks on one account within a window are
//! therefore escalated to a hard block.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::store::CorrelationStore;

/// Soft-block counting keyed by a derived account key, never a raw id.
#[async_trait]
pub trait AntiEquilibriumGate: Send + Sync {
    async fn record_soft_block(&self, account_key: &str) -> StoreResult<()>;

    async fn should_escalate(&self, account_key: &str) -> StoreResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquilibriumConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Soft blocks within the window that trigger escalation
    #[serde(default = "default_soft_block_limit")]
    pub soft_block_limit: i64,
}

fn default_window() -> u64 {
    3600
}

fn default_soft_block_limit() -> i64 {
    3
}

impl Default for EquilibriumConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            soft_block_limit: default_soft_block_limit(),
        }
    }
}

/// Gate counting soft blocks in correlation-store watch flags.
pub struct CorrelationEquilibriumGate {
    correlation: Arc<dyn CorrelationStore>,
    config: EquilibriumConfig,
}

impl CorrelationEquilibriumGate {
    pub fn new(correlation: Arc<dyn CorrelationStore>, config: EquilibriumConfig) -> Self {
        Self {
            correlation,
            config,
        }
    }

    fn flag_key(account_key: &str) -> String {
        format!("equilibrium:{}", account_key)
    }
}

#[async_trait]
impl AntiEquilibriumGate for CorrelationEquilibriumGate {
    async fn record_soft_block(&self, account_key: &str) -> StoreResult<()> {
        self.correlation
            .increment_watch_flag(&Self::flag_key(account_key), self.config.window_secs)
            .await?;
        Ok(())
    }

    async fn should_escalate(&self, account_key: &str) -> StoreResult<bool> {
        let soft_blocks = self
            .correlation
            .get_watch_flag(&Self::flag_key(account_key))
            .await?;
        Ok(soft_blocks >= self.config.soft_block_limit)
    }
}
