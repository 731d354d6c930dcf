//! Process-local coarse limiter used while the store is unhealthy.
//!
//! Counters are best-effort and never shared between processes. They are
//! reset wholesale every `reset_interval_secs`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{elapsed_secs, Clock};
use crate::ratelimit::policy::{BlockPolicy, PolicyKind};
use crate::ratelimit::types::{OperatingMode, RateLimitContext};

/// Caps applied by the local fallback limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
    #[serde(default = "default_login_per_account")]
    pub login_per_account: u32,
    #[serde(default = "default_login_per_ip")]
    pub login_per_ip: u32,
    #[serde(default = "default_otp_per_account")]
    pub otp_per_account: u32,
    #[serde(default = "default_otp_per_ip")]
    pub otp_per_ip: u32,
    #[serde(default = "default_api_per_ip")]
    pub api_per_ip: u32,
    #[serde(default = "default_api_per_ip_ua")]
    pub api_per_ip_ua: u32,
    /// Retry hint returned when the fallback denies
    #[serde(default = "default_deny_retry")]
    pub deny_retry_secs: u64,
}

fn default_reset_interval() -> u64 {
    600
}

fn default_login_per_account() -> u32 {
    3
}

fn default_login_per_ip() -> u32 {
    20
}

fn default_otp_per_account() -> u32 {
    2
}

fn default_otp_per_ip() -> u32 {
    10
}

fn default_api_per_ip() -> u32 {
    300
}

fn default_api_per_ip_ua() -> u32 {
    120
}

fn default_deny_retry() -> u64 {
    600
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: default_reset_interval(),
            login_per_account: default_login_per_account(),
            login_per_ip: default_login_per_ip(),
            otp_per_account: default_otp_per_account(),
            otp_per_ip: default_otp_per_ip(),
            api_per_ip: default_api_per_ip(),
            api_per_ip_ua: default_api_per_ip_ua(),
            deny_retry_secs: default_deny_retry(),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: DateTime<Utc>,
    counters: HashMap<String, u32>,
}

/// In-memory fallback limiter with its own counters and reset clock.
#[derive(Debug)]
pub struct LocalFallbackLimiter {
    config: FallbackConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<Window>,
}

impl LocalFallbackLimiter {
    pub fn new(config: FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        let started = clock.now();
        Self {
            config,
            clock,
            window: Mutex::new(Window {
                started,
                counters: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Count this request and report whether it is still within the caps
    /// that apply to `policy` in `mode`.
    pub fn allow(
        &self,
        policy: &BlockPolicy,
        mode: OperatingMode,
        context: &RateLimitContext,
        normalized_ua: &str,
    ) -> bool {
        let caps = self.caps_for(policy.kind(), mode, context, normalized_ua);
        if caps.is_empty() {
            return true;
        }

        let now = self.clock.now();
        let mut window = self.window.lock();
        if elapsed_secs(window.started, now) >= self.config.reset_interval_secs as i64 {
            window.counters.clear();
            window.started = now;
        }

        let mut allowed = true;
        for (scope, cap) in caps {
            let counter = window
                .counters
                .entry(format!("{}:{}", policy.name, scope))
                .or_insert(0);
            *counter = counter.saturating_add(1);
            if *counter > cap {
                debug!(policy = %policy.name, mode = %mode, cap, "Local fallback cap reached");
                allowed = false;
            }
        }
        allowed
    }

    fn caps_for(
        &self,
        kind: PolicyKind,
        mode: OperatingMode,
        context: &RateLimitContext,
        normalized_ua: &str,
    ) -> Vec<(String, u32)> {
        let account = |cap: u32| context.account_id.map(|id| (format!("acct:{}", id), cap));
        let ip = |cap: u32| (format!("ip:{}", context.ip), cap);

        match (kind, mode) {
            (PolicyKind::Login, OperatingMode::DegradedMode) => account(self.config.login_per_account)
                .into_iter()
                .chain([ip(self.config.login_per_ip)])
                .collect(),
            (PolicyKind::Otp, OperatingMode::DegradedMode) => account(self.config.otp_per_account)
                .into_iter()
                .chain([ip(self.config.otp_per_ip)])
                .collect(),
            (PolicyKind::ApiHeavy, OperatingMode::DegradedMode | OperatingMode::FailOpen) => vec![
                ip(self.config.api_per_ip),
                (
                    format!("ipua:{}|{}", context.ip, normalized_ua),
                    self.config.api_per_ip_ua,
                ),
            ],
            _ => Vec::new(),
        }
    }
}
