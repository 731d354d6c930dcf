//! Block policy configuration and loading.
//!
//! Policies are read-only configuration: score thresholds per key type,
//! score deltas per event, an optional budget and the preferred failure
//! mode. They are validated once at load time.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::keys::KeyType;
use super::ladder::PenaltyLadder;
use crate::error::{RateLimiterError, Result};

/// Threshold table key used when a key type has no table of its own.
pub const DEFAULT_THRESHOLDS: &str = "default";

/// Score delta names understood by the evaluation pipeline.
pub mod deltas {
    pub const ACCESS: &str = "access";
    pub const K5_FAILURE: &str = "k5_failure";
    pub const K4_FAILURE: &str = "k4_failure";
    pub const K3_FAILURE: &str = "k3_failure";
    pub const K2_FAILURE: &str = "k2_failure";
    pub const K1_FAILURE: &str = "k1_failure";
    pub const K2_MISSING_FP: &str = "k2_missing_fp";
    pub const K1_SPRAY: &str = "k1_spray";
    pub const K4_REPEATED_MISSING_FP: &str = "k4_repeated_missing_fp";

    pub const ALL: [&str; 9] = [
        ACCESS,
        K5_FAILURE,
        K4_FAILURE,
        K3_FAILURE,
        K2_FAILURE,
        K1_FAILURE,
        K2_MISSING_FP,
        K1_SPRAY,
        K4_REPEATED_MISSING_FP,
    ];
}

/// Preferred behaviour while the backing store is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureMode {
    #[default]
    FailOpen,
    FailClosed,
}

/// Traffic class of a policy; selects local fallback caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Login,
    Otp,
    ApiHeavy,
    Standard,
}

impl PolicyKind {
    /// Infer the kind from one of the well-known policy names.
    pub fn from_name(name: &str) -> Self {
        match name {
            "login_protection" => PolicyKind::Login,
            "otp_protection" => PolicyKind::Otp,
            "api_heavy_protection" => PolicyKind::ApiHeavy,
            _ => PolicyKind::Standard,
        }
    }
}

/// Per-account budget: a rolling counter that soft-blocks once exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub threshold: i64,
    pub block_level: u32,
}

/// A single named block policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPolicy {
    pub name: String,
    /// Traffic class; inferred from the name when omitted
    #[serde(default)]
    pub kind: Option<PolicyKind>,
    /// Key type (or `default`) -> score threshold -> level
    #[serde(default)]
    pub score_thresholds: HashMap<String, BTreeMap<i64, u32>>,
    /// Event name -> signed score delta
    #[serde(default)]
    pub score_deltas: HashMap<String, i64>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Block duration per level, overriding the default ladder
    #[serde(default)]
    pub ladder: Option<PenaltyLadder>,
}

impl BlockPolicy {
    /// An empty policy with no thresholds or deltas.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            score_thresholds: HashMap::new(),
            score_deltas: HashMap::new(),
            budget: None,
            failure_mode: FailureMode::default(),
            ladder: None,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind.unwrap_or_else(|| PolicyKind::from_name(&self.name))
    }

    /// The ladder in effect for this policy.
    pub fn ladder(&self) -> PenaltyLadder {
        self.ladder.clone().unwrap_or_default()
    }

    pub fn delta(&self, name: &str) -> Option<i64> {
        self.score_deltas.get(name).copied()
    }

    fn thresholds_for(&self, key_type: KeyType) -> Option<&BTreeMap<i64, u32>> {
        self.score_thresholds
            .get(key_type.as_str())
            .or_else(|| self.score_thresholds.get(DEFAULT_THRESHOLDS))
    }

    /// Highest configured level whose threshold `score` reaches.
    pub fn level_for(&self, key_type: KeyType, score: i64) -> u32 {
        self.thresholds_for(key_type)
            .and_then(|table| {
                table
                    .iter()
                    .rev()
                    .find(|(threshold, _)| score >= **threshold)
                    .map(|(_, level)| *level)
            })
            .unwrap_or(0)
    }

    /// The threshold `score` sits exactly one below, if any, with its level.
    pub fn threshold_just_above(&self, key_type: KeyType, score: i64) -> Option<(i64, u32)> {
        self.thresholds_for(key_type)?
            .get_key_value(&score.checked_add(1)?)
            .map(|(threshold, level)| (*threshold, *level))
    }

    /// Check the policy for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RateLimiterError::InvalidPolicy {
            policy: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("policy name must not be empty".to_string()));
        }
        for (key_type, table) in &self.score_thresholds {
            for (threshold, level) in table {
                if *threshold <= 0 {
                    return Err(invalid(format!(
                        "threshold {} for {} must be positive",
                        threshold, key_type
                    )));
                }
                if *level == 0 {
                    return Err(invalid(format!(
                        "threshold {} for {} maps to level 0",
                        threshold, key_type
                    )));
                }
            }
        }
        if let Some(budget) = &self.budget {
            if budget.threshold <= 0 || budget.block_level == 0 {
                return Err(invalid(
                    "budget needs a positive threshold and block level".to_string(),
                ));
            }
        }
        if let Some(ladder) = &self.ladder {
            if PenaltyLadder::new(ladder.rungs().to_vec()).is_none() {
                return Err(invalid(
                    "ladder must be non-empty and non-decreasing".to_string(),
                ));
            }
        }
        for name in self.score_deltas.keys() {
            if !deltas::ALL.contains(&name.as_str()) {
                warn!(policy = %self.name, delta = %name, "Ignoring unknown score delta");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    policies: Vec<BlockPolicy>,
}

/// All configured policies, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, BlockPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated set from a list of policies.
    pub fn from_policies(policies: impl IntoIterator<Item = BlockPolicy>) -> Result<Self> {
        let mut set = Self::new();
        for policy in policies {
            set.insert(policy)?;
        }
        Ok(set)
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading block policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from YAML: either a `policies:` list or a single policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(document) = serde_yaml::from_str::<PolicyDocument>(yaml) {
            return Self::from_policies(document.policies);
        }

        let policy = serde_yaml::from_str::<BlockPolicy>(yaml).map_err(|e| {
            RateLimiterError::Config(format!("Failed to parse block policies: {}", e))
        })?;
        Self::from_policies([policy])
    }

    /// Add a policy after validating it. Duplicate names are rejected.
    pub fn insert(&mut self, policy: BlockPolicy) -> Result<()> {
        policy.validate()?;
        if self.policies.contains_key(&policy.name) {
            return Err(RateLimiterError::Config(format!(
                "duplicate policy name: {}",
                policy.name
            )));
        }
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BlockPolicy> {
        self.policies.get(name)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICIES: &str = r#"
policies:
  - name: login_protection
    failure_mode: FAIL_CLOSED
    score_thresholds:
      default:
        10: 1
        20: 2
      k4:
        5: 1
        8: 3
    score_deltas:
      k4_failure: 2
      k5_failure: 3
      k1_spray: 1
    budget:
      threshold: 50
      block_level: 2
  - name: api_heavy_protection
    score_thresholds:
      default:
        100: 1
    score_deltas:
      access: 1
    ladder: [5, 30, 30, 120]
"#;

    #[test]
    fn test_parse_policy_list() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        assert_eq!(set.len(), 2);

        let login = set.get("login_protection").unwrap();
        assert_eq!(login.failure_mode, FailureMode::FailClosed);
        assert_eq!(login.kind(), PolicyKind::Login);
        assert_eq!(login.delta(deltas::K4_FAILURE), Some(2));
        assert_eq!(login.budget.as_ref().unwrap().block_level, 2);

        let api = set.get("api_heavy_protection").unwrap();
        assert_eq!(api.kind(), PolicyKind::ApiHeavy);
        assert_eq!(api.failure_mode, FailureMode::FailOpen);
        assert_eq!(api.ladder().duration(2), 30);
    }

    #[test]
    fn test_parse_single_policy() {
        let yaml = r#"
name: search
kind: api_heavy
score_deltas:
  access: 1
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert_eq!(set.get("search").unwrap().kind(), PolicyKind::ApiHeavy);
    }

    #[test]
    fn test_level_for_uses_highest_reached_threshold() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let login = set.get("login_protection").unwrap();

        assert_eq!(login.level_for(KeyType::K1, 9), 0);
        assert_eq!(login.level_for(KeyType::K1, 10), 1);
        assert_eq!(login.level_for(KeyType::K2, 25), 2);
        // k4 has its own table
        assert_eq!(login.level_for(KeyType::K4, 6), 1);
        assert_eq!(login.level_for(KeyType::K4, 8), 3);
    }

    #[test]
    fn test_threshold_just_above() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let login = set.get("login_protection").unwrap();

        assert_eq!(login.threshold_just_above(KeyType::K1, 19), Some((20, 2)));
        assert_eq!(login.threshold_just_above(KeyType::K1, 18), None);
        assert_eq!(login.threshold_just_above(KeyType::K4, 7), Some((8, 3)));
    }

    #[test]
    fn test_rejects_invalid_policies() {
        let zero_level = r#"
name: broken
score_thresholds:
  default:
    10: 0
"#;
        assert!(matches!(
            PolicySet::from_yaml(zero_level),
            Err(RateLimiterError::InvalidPolicy { .. })
        ));

        let decreasing_ladder = r#"
name: broken
ladder: [60, 15]
"#;
        assert!(PolicySet::from_yaml(decreasing_ladder).is_err());

        let bad_budget = r#"
name: broken
budget:
  threshold: 0
  block_level: 2
"#;
        assert!(PolicySet::from_yaml(bad_budget).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = PolicySet::from_policies([BlockPolicy::new("a"), BlockPolicy::new("a")]);
        assert!(matches!(result, Err(RateLimiterError::Config(_))));
    }

    #[test]
    fn test_kind_inferred_from_name() {
        assert_eq!(PolicyKind::from_name("otp_protection"), PolicyKind::Otp);
        assert_eq!(PolicyKind::from_name("anything"), PolicyKind::Standard);
        assert_eq!(BlockPolicy::new("login_protection").kind(), PolicyKind::Login);
    }
}
