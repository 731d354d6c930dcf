//! Request, identity and verdict types shared across the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-request network and account context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitContext {
    /// Client IP address as seen by the edge
    pub ip: String,
    /// Raw `User-Agent` header
    pub user_agent: String,
    /// Authenticated or targeted account, if any
    #[serde(default)]
    pub account_id: Option<i64>,
    /// Raw client fingerprint material, consumed only by the device resolver
    #[serde(default)]
    pub device_hint: Option<String>,
    /// Whether the request rides an already-trusted session
    #[serde(default)]
    pub trusted_session: bool,
}

impl RateLimitContext {
    /// Create a context from the three core signals.
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>, account_id: Option<i64>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            account_id,
            device_hint: None,
            trusted_session: false,
        }
    }

    /// Attach raw fingerprint material.
    pub fn with_device_hint(mut self, hint: impl Into<String>) -> Self {
        self.device_hint = Some(hint.into());
        self
    }

    /// Mark the request as belonging to a trusted session.
    pub fn with_trusted_session(mut self, trusted: bool) -> Self {
        self.trusted_session = trusted;
        self
    }
}

/// What the caller wants evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRequest {
    pub policy_name: String,
    /// Evaluate without mutating scores
    #[serde(default)]
    pub is_pre_check: bool,
    /// This call represents a failed attempt (bad password, wrong OTP...)
    #[serde(default)]
    pub is_failure: bool,
    /// Multiplier for the policy's `access` delta
    #[serde(default = "default_cost")]
    pub cost: f64,
}

fn default_cost() -> f64 {
    1.0
}

impl RateLimitRequest {
    /// A plain access against `policy_name` with unit cost.
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            is_pre_check: false,
            is_failure: false,
            cost: default_cost(),
        }
    }

    pub fn pre_check(mut self) -> Self {
        self.is_pre_check = true;
        self
    }

    pub fn failure(mut self) -> Self {
        self.is_failure = true;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Values of the `signal` metadata entry explaining a verdict.
pub mod signals {
    pub const ACTIVE_BLOCK: &str = "ACTIVE_BLOCK";
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const SCORE_THRESHOLD: &str = "SCORE_THRESHOLD";
    pub const FINGERPRINT_CHURN: &str = "FINGERPRINT_CHURN";
    pub const IP_DILUTION: &str = "IP_DILUTION";
    pub const NEW_DEVICE_FLOOD: &str = "NEW_DEVICE_FLOOD";
    pub const NEAR_THRESHOLD_REPEAT: &str = "NEAR_THRESHOLD_REPEAT";
    pub const ANTI_EQUILIBRIUM: &str = "ANTI_EQUILIBRIUM";
    pub const SCORE_ESCALATION: &str = "SCORE_ESCALATION";
    pub const LOCAL_FALLBACK_LIMIT: &str = "LOCAL_FALLBACK_LIMIT";
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
    pub const CRITICAL_RE_ENTRY_VIOLATION: &str = "CRITICAL_RE_ENTRY_VIOLATION";
}

/// Metadata key naming the signal behind a verdict.
pub const META_SIGNAL: &str = "signal";
/// Metadata key naming the composite key type that drove a verdict.
pub const META_KEY: &str = "key";

/// Confidence the resolver has in a device fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Resolved device identity for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub normalized_ua: String,
    pub fingerprint_hash: Option<String>,
    pub confidence: Confidence,
    pub is_trusted_session: bool,
}

/// The admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    SoftBlock,
    HardBlock,
}

impl Decision {
    /// Decision implied by a block level.
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Decision::Allow,
            1 => Decision::SoftBlock,
            _ => Decision::HardBlock,
        }
    }
}

/// The mode the engine operated in when producing a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Normal,
    FailOpen,
    DegradedMode,
    FailClosed,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OperatingMode::Normal => "NORMAL",
            OperatingMode::FailOpen => "FAIL_OPEN",
            OperatingMode::DegradedMode => "DEGRADED_MODE",
            OperatingMode::FailClosed => "FAIL_CLOSED",
        };
        f.write_str(label)
    }
}

/// Verdict returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub decision: Decision,
    pub level: u32,
    pub retry_after_seconds: u64,
    pub mode: OperatingMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RateLimitResult {
    /// Build a verdict whose decision follows from `level`.
    pub fn from_level(level: u32, retry_after_seconds: u64, mode: OperatingMode) -> Self {
        let retry_after_seconds = if level == 0 { 0 } else { retry_after_seconds };
        Self {
            decision: Decision::from_level(level),
            level,
            retry_after_seconds,
            mode,
            metadata: BTreeMap::new(),
        }
    }

    /// An unconditional allow in the given mode.
    pub fn allow(mode: OperatingMode) -> Self {
        Self::from_level(0, 0, mode)
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}
