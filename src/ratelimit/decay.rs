//! Time decay of abuse scores.

use serde::{Deserialize, Serialize};

use super::keys::ScopeClass;

/// Half-lives per scope class, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayConfig {
    #[serde(default = "default_ip_half_life")]
    pub ip_half_life_secs: u64,
    #[serde(default = "default_device_half_life")]
    pub device_half_life_secs: u64,
    #[serde(default = "default_account_half_life")]
    pub account_half_life_secs: u64,
}

fn default_ip_half_life() -> u64 {
    600
}

fn default_device_half_life() -> u64 {
    1800
}

fn default_account_half_life() -> u64 {
    3600
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            ip_half_life_secs: default_ip_half_life(),
            device_half_life_secs: default_device_half_life(),
            account_half_life_secs: default_account_half_life(),
        }
    }
}

/// Exponential decay toward zero.
///
/// Network scopes forgive fastest, accounts slowest. An active block on the
/// key stretches the half-life by `1 + level`, so a blocked key does not
/// decay back under its threshold while the block is still running.
#[derive(Debug, Clone, Default)]
pub struct DecayCalculator {
    config: DecayConfig,
}

impl DecayCalculator {
    pub fn new(config: DecayConfig) -> Self {
        Self { config }
    }

    /// Decayed value of `raw` after `elapsed_secs`.
    pub fn decay(
        &self,
        raw: i64,
        elapsed_secs: i64,
        block_level: Option<u32>,
        scope: ScopeClass,
    ) -> i64 {
        if raw == 0 || elapsed_secs <= 0 {
            return raw;
        }
        let base = match scope {
            ScopeClass::Ip => self.config.ip_half_life_secs,
            ScopeClass::Device => self.config.device_half_life_secs,
            ScopeClass::Account => self.config.account_half_life_secs,
        };
        if base == 0 {
            return 0;
        }
        let stretch = 1 + u64::from(block_level.unwrap_or(0));
        let half_life = base.saturating_mul(stretch) as f64;
        let factor = 0.5f64.powf(elapsed_secs as f64 / half_life);
        (raw as f64 * factor).trunc() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_elapsed_time_keeps_score() {
        let calc = DecayCalculator::default();
        assert_eq!(calc.decay(100, 0, None, ScopeClass::Ip), 100);
    }

    #[test]
    fn test_one_half_life_halves_score() {
        let calc = DecayCalculator::default();
        assert_eq!(calc.decay(100, 600, None, ScopeClass::Ip), 50);
        assert_eq!(calc.decay(100, 1800, None, ScopeClass::Device), 50);
        assert_eq!(calc.decay(100, 3600, None, ScopeClass::Account), 50);
    }

    #[test]
    fn test_account_scope_decays_slower_than_ip() {
        let calc = DecayCalculator::default();
        let ip = calc.decay(100, 1200, None, ScopeClass::Ip);
        let account = calc.decay(100, 1200, None, ScopeClass::Account);
        assert!(account > ip);
    }

    #[test]
    fn test_active_block_slows_decay() {
        let calc = DecayCalculator::default();
        let unblocked = calc.decay(100, 600, None, ScopeClass::Ip);
        let blocked = calc.decay(100, 600, Some(2), ScopeClass::Ip);
        assert!(blocked > unblocked);
    }

    #[test]
    fn test_negative_scores_decay_toward_zero() {
        let calc = DecayCalculator::default();
        assert_eq!(calc.decay(-100, 600, None, ScopeClass::Ip), -50);
        assert_eq!(calc.decay(5, 100_000, None, ScopeClass::Ip), 0);
    }
}
