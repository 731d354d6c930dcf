//! Configuration management for the adaptive rate limiter.

use serde::{Deserialize, Serialize};

use crate::error::{RateLimiterError, Result};
use crate::guard::{BudgetTrackerConfig, EphemeralConfig, EquilibriumConfig};
use crate::ratelimit::decay::DecayConfig;
use crate::resilience::circuit_breaker::MAX_BREAKER_WINDOW_SECS;
use crate::resilience::{CircuitBreakerConfig, FallbackConfig};

/// Prefix of environment variables overriding file settings, e.g.
/// `ADAPTIVE_RATELIMIT__KEYS__SECRET`.
pub const ENV_PREFIX: &str = "ADAPTIVE_RATELIMIT";

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Composite key derivation
    #[serde(default)]
    pub keys: KeyConfig,

    /// Score retention and decay
    #[serde(default)]
    pub scores: ScoreConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Local caps used while the store is unhealthy
    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub ephemeral: EphemeralConfig,

    #[serde(default)]
    pub equilibrium: EquilibriumConfig,

    #[serde(default)]
    pub budget: BudgetTrackerConfig,

    /// Path to the YAML policy file
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Key derivation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// HMAC secret shared by every instance evaluating the same store
    #[serde(default)]
    pub secret: String,
}

/// Score retention and decay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreConfig {
    /// TTL applied to a score on every increment
    #[serde(default = "default_score_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_ip_half_life")]
    pub ip_half_life_secs: u64,

    #[serde(default = "default_device_half_life")]
    pub device_half_life_secs: u64,

    #[serde(default = "default_account_half_life")]
    pub account_half_life_secs: u64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_score_ttl(),
            ip_half_life_secs: default_ip_half_life(),
            device_half_life_secs: default_device_half_life(),
            account_half_life_secs: default_account_half_life(),
        }
    }
}

impl ScoreConfig {
    pub fn decay(&self) -> DecayConfig {
        DecayConfig {
            ip_half_life_secs: self.ip_half_life_secs,
            device_half_life_secs: self.device_half_life_secs,
            account_half_life_secs: self.account_half_life_secs,
        }
    }
}

fn default_score_ttl() -> u64 {
    86_400
}

fn default_ip_half_life() -> u64 {
    DecayConfig::default().ip_half_life_secs
}

fn default_device_half_life() -> u64 {
    DecayConfig::default().device_half_life_secs
}

fn default_account_half_life() -> u64 {
    DecayConfig::default().account_half_life_secs
}

impl RateLimiterConfig {
    /// Load configuration from an optional file plus `ADAPTIVE_RATELIMIT__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: RateLimiterConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RateLimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimiterConfig =
            serde_yaml::from_str(yaml).map_err(|e| RateLimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A default configuration keyed with `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            keys: KeyConfig {
                secret: secret.into(),
            },
            ..Self::default()
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(RateLimiterError::Config(reason.to_string()));

        if self.keys.secret.is_empty() {
            return invalid("keys.secret must be set");
        }
        if self.scores.ttl_secs == 0 {
            return invalid("scores.ttl_secs must be positive");
        }
        if self.circuit_breaker.trip_threshold == 0 {
            return invalid("circuit_breaker.trip_threshold must be positive");
        }
        if let Some(window) = self.circuit_breaker.oversized_window() {
            return invalid(&format!(
                "circuit_breaker.{} must not exceed {} seconds",
                window, MAX_BREAKER_WINDOW_SECS
            ));
        }
        if self.fallback.reset_interval_secs == 0 {
            return invalid("fallback.reset_interval_secs must be positive");
        }
        if self.ephemeral.distinct_ua_limit == 0 {
            return invalid("ephemeral.distinct_ua_limit must be positive");
        }
        if self.equilibrium.soft_block_limit <= 0 {
            return invalid("equilibrium.soft_block_limit must be positive");
        }
        if self.budget.window_secs == 0 {
            return invalid("budget.window_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RateLimiterConfig::with_secret("s3cret");
        assert!(config.validate().is_ok());
        assert_eq!(config.scores.ttl_secs, 86_400);
        assert_eq!(config.scores.decay(), DecayConfig::default());
        assert_eq!(config.circuit_breaker.trip_threshold, 3);
        assert_eq!(config.fallback.deny_retry_secs, 600);
        assert!(config.policies_path.is_none());
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let err = RateLimiterConfig::default().validate().unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RateLimiterConfig::from_yaml(
            r#"
keys:
  secret: from-yaml
scores:
  ip_half_life_secs: 120
circuit_breaker:
  trip_threshold: 5
policies_path: /etc/adaptive-ratelimit/policies.yaml
"#,
        )
        .unwrap();

        assert_eq!(config.keys.secret, "from-yaml");
        assert_eq!(config.scores.ip_half_life_secs, 120);
        assert_eq!(config.scores.account_half_life_secs, 3600);
        assert_eq!(config.circuit_breaker.trip_threshold, 5);
        assert_eq!(config.circuit_breaker.trip_window_secs, 10);
        assert_eq!(
            config.policies_path.as_deref(),
            Some("/etc/adaptive-ratelimit/policies.yaml")
        );
    }

    #[test]
    fn test_oversized_breaker_window_is_rejected() {
        let mut config = RateLimiterConfig::with_secret("s3cret");
        config.circuit_breaker.re_entry_window_secs = 10_000_000_000_000;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(reason) if reason.contains("re_entry_window_secs")));
    }

    #[test]
    fn test_invalid_yaml_is_a_config_error() {
        let err = RateLimiterConfig::from_yaml("keys: [unclosed").unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!(
            "adaptive-ratelimit-config-{}.yaml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "keys:\n  secret: on-disk\nfallback:\n  login_per_ip: 7\n").unwrap();

        let config = RateLimiterConfig::load(path.to_str()).unwrap();
        assert_eq!(config.keys.secret, "on-disk");
        assert_eq!(config.fallback.login_per_ip, 7);

        std::fs::remove_file(path).unwrap();
    }
}
