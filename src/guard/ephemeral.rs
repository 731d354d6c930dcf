//! Ephemeral fingerprint classification and per-account device counts.
//!
//! A fingerprint that keeps showing up under different user agents is not a
//! stable device identity. Such fingerprints must never create or update
//! device-scoped scores or blocks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::device::normalize_user_agent;
use crate::error::StoreResult;
use crate::ratelimit::types::RateLimitContext;
use crate::store::CorrelationStore;

/// Outcome of an ephemeral check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EphemeralCheck {
    pub is_ephemeral: bool,
    /// Distinct devices seen for the account within the device window
    pub account_device_count: u64,
    /// Whether this fingerprint was not yet known for the account
    pub is_new_device: bool,
}

#[async_trait]
pub trait EphemeralBucket: Send + Sync {
    /// `account_key` is the policy's derived account key; device counts are
    /// kept under it rather than under the raw account id.
    async fn check(
        &self,
        context: &RateLimitContext,
        fingerprint_hash: &str,
        account_key: Option<&str>,
    ) -> StoreResult<Option<EphemeralCheck>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralConfig {
    /// Distinct user agents per fingerprint that mark it ephemeral
    #[serde(default = "default_distinct_ua_limit")]
    pub distinct_ua_limit: u64,
    #[serde(default = "default_ua_window")]
    pub ua_window_secs: u64,
    #[serde(default = "default_device_window")]
    pub device_window_secs: u64,
}

fn default_distinct_ua_limit() -> u64 {
    3
}

fn default_ua_window() -> u64 {
    3600
}

fn default_device_window() -> u64 {
    30 * 86_400
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            distinct_ua_limit: default_distinct_ua_limit(),
            ua_window_secs: default_ua_window(),
            device_window_secs: default_device_window(),
        }
    }
}

/// Ephemeral bucket backed by correlation-store distinct sets.
pub struct CorrelationEphemeralBucket {
    correlation: Arc<dyn CorrelationStore>,
    config: EphemeralConfig,
}

impl CorrelationEphemeralBucket {
    pub fn new(correlation: Arc<dyn CorrelationStore>, config: EphemeralConfig) -> Self {
        Self {
            correlation,
            config,
        }
    }
}

#[async_trait]
impl EphemeralBucket for CorrelationEphemeralBucket {
    async fn check(
        &self,
        context: &RateLimitContext,
        fingerprint_hash: &str,
        account_key: Option<&str>,
    ) -> StoreResult<Option<EphemeralCheck>> {
        if fingerprint_hash.is_empty() {
            return Ok(None);
        }

        let ua = normalize_user_agent(&context.user_agent);
        let distinct_uas = self
            .correlation
            .add_distinct(
                &format!("ephemeral:ua:{}", fingerprint_hash),
                &ua,
                self.config.ua_window_secs,
            )
            .await?;
        let is_ephemeral = distinct_uas >= self.config.distinct_ua_limit;

        let (account_device_count, is_new_device) = match account_key {
            Some(account_key) => {
                let count = self
                    .correlation
                    .add_distinct(
                        &format!("ephemeral:devices:{}", account_key),
                        fingerprint_hash,
                        self.config.device_window_secs,
                    )
                    .await?;
                let sightings = self
                    .correlation
                    .increment_watch_flag(
                        &format!("ephemeral:seen:{}:{}", account_key, fingerprint_hash),
                        self.config.device_window_secs,
                    )
                    .await?;
                (count, sightings == 1)
            }
            None => (0, false),
        };

        trace!(distinct_uas, is_ephemeral, account_device_count, "Ephemeral check");
        Ok(Some(EphemeralCheck {
            is_ephemeral,
            account_device_count,
            is_new_device,
        }))
    }
}
