//! Circuit breaker guarding the backing store's health.
//!
//! One breaker state exists per policy name and lives in a
//! [`CircuitBreakerStore`]. The breaker trips after a burst of failures and
//! only closes again once the store has been both degraded long enough and
//! quiet long enough, so a single lucky success cannot cause flapping.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_secs, Clock};
use crate::error::StoreResult;
use crate::store::CircuitBreakerStore;

/// Breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    /// Store considered healthy
    #[default]
    Closed,
    /// Store considered unhealthy, evaluations fall back
    Open,
}

/// Longest window or interval the breaker accepts, one year.
pub const MAX_BREAKER_WINDOW_SECS: u64 = 365 * 86_400;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Window in which failures count toward tripping
    #[serde(default = "default_trip_window")]
    pub trip_window_secs: u64,
    /// Failures within the window that open the circuit
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: usize,
    /// Minimum time spent open before closing
    #[serde(default = "default_min_degraded")]
    pub min_degraded_secs: u64,
    /// Minimum time since the last failure before closing
    #[serde(default = "default_min_healthy")]
    pub min_healthy_secs: u64,
    /// Window over which OPEN transitions are remembered
    #[serde(default = "default_re_entry_window")]
    pub re_entry_window_secs: u64,
    /// OPEN transitions tolerated within the re-entry window
    #[serde(default = "default_re_entry_limit")]
    pub re_entry_limit: usize,
}

fn default_trip_window() -> u64 {
    10
}

fn default_trip_threshold() -> usize {
    3
}

fn default_min_degraded() -> u64 {
    300
}

fn default_min_healthy() -> u64 {
    120
}

fn default_re_entry_window() -> u64 {
    1800
}

fn default_re_entry_limit() -> usize {
    2
}

impl CircuitBreakerConfig {
    /// The first window or interval above [`MAX_BREAKER_WINDOW_SECS`], by name.
    pub fn oversized_window(&self) -> Option<&'static str> {
        [
            ("trip_window_secs", self.trip_window_secs),
            ("min_degraded_secs", self.min_degraded_secs),
            ("min_healthy_secs", self.min_healthy_secs),
            ("re_entry_window_secs", self.re_entry_window_secs),
        ]
        .into_iter()
        .find(|(_, value)| *value > MAX_BREAKER_WINDOW_SECS)
        .map(|(name, _)| name)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip_window_secs: default_trip_window(),
            trip_threshold: default_trip_threshold(),
            min_degraded_secs: default_min_degraded(),
            min_healthy_secs: default_min_healthy(),
            re_entry_window_secs: default_re_entry_window(),
            re_entry_limit: default_re_entry_limit(),
        }
    }
}

/// Persisted breaker state for one policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub status: BreakerStatus,
    /// Failure timestamps within the trip window
    #[serde(default)]
    pub failures: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub open_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    /// Timestamps of OPEN transitions within the re-entry window
    #[serde(default)]
    pub re_entries: Vec<DateTime<Utc>>,
}

impl CircuitBreakerState {
    /// Drop failures and re-entries that fell out of their windows.
    pub fn prune(&mut self, now: DateTime<Utc>, config: &CircuitBreakerConfig) {
        let failure_horizon = now - secs(config.trip_window_secs);
        self.failures.retain(|at| *at > failure_horizon);
        let re_entry_horizon = now - secs(config.re_entry_window_secs);
        self.re_entries.retain(|at| *at > re_entry_horizon);
    }

    /// Record a failure. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&mut self, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> bool {
        self.prune(now, config);
        self.failures.push(now);
        self.last_failure = Some(now);

        if self.status == BreakerStatus::Closed && self.failures.len() >= config.trip_threshold {
            self.status = BreakerStatus::Open;
            self.open_since = Some(now);
            self.re_entries.push(now);
            return true;
        }
        false
    }

    /// Record a success. Returns `true` if this success closed the circuit.
    pub fn record_success(&mut self, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> bool {
        if self.status == BreakerStatus::Closed {
            return false;
        }
        self.last_success = Some(now);

        let degraded_long_enough = self
            .open_since
            .map_or(true, |since| elapsed_secs(since, now) >= bounded(config.min_degraded_secs));
        let healthy_long_enough = self
            .last_failure
            .map_or(true, |at| elapsed_secs(at, now) >= bounded(config.min_healthy_secs));

        if degraded_long_enough && healthy_long_enough {
            self.status = BreakerStatus::Closed;
            self.failures.clear();
            self.open_since = None;
            return true;
        }
        false
    }

    /// Whether OPEN transitions within the window exceed the limit.
    pub fn re_entry_guard_violated(&self, config: &CircuitBreakerConfig) -> bool {
        self.re_entries.len() > config.re_entry_limit
    }
}

/// Seconds capped at [`MAX_BREAKER_WINDOW_SECS`].
fn bounded(value: u64) -> i64 {
    value.min(MAX_BREAKER_WINDOW_SECS) as i64
}

fn secs(value: u64) -> Duration {
    Duration::seconds(bounded(value))
}

/// Point-in-time view of a breaker used for failure-mode resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    pub re_entry_violated: bool,
}

impl BreakerSnapshot {
    /// Assumed view when the breaker state itself cannot be read.
    pub fn unknown() -> Self {
        Self {
            status: BreakerStatus::Open,
            re_entry_violated: false,
        }
    }
}

/// Store-backed circuit breaker, keyed by policy name.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitBreakerStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn CircuitBreakerStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Load and prune the state for a policy.
    pub async fn state(&self, policy_name: &str) -> StoreResult<CircuitBreakerState> {
        let mut state = self.store.load(policy_name).await?.unwrap_or_default();
        state.prune(self.clock.now(), &self.config);
        Ok(state)
    }

    pub async fn status(&self, policy_name: &str) -> StoreResult<BreakerStatus> {
        Ok(self.state(policy_name).await?.status)
    }

    pub async fn is_re_entry_guard_violated(&self, policy_name: &str) -> StoreResult<bool> {
        Ok(self
            .state(policy_name)
            .await?
            .re_entry_guard_violated(&self.config))
    }

    pub async fn snapshot(&self, policy_name: &str) -> StoreResult<BreakerSnapshot> {
        let state = self.state(policy_name).await?;
        Ok(BreakerSnapshot {
            status: state.status,
            re_entry_violated: state.re_entry_guard_violated(&self.config),
        })
    }

    /// Account a store failure for `policy_name`.
    pub async fn report_failure(&self, policy_name: &str) -> StoreResult<BreakerStatus> {
        let now = self.clock.now();
        let mut state = self.state(policy_name).await?;

        if state.record_failure(now, &self.config) {
            warn!(
                policy = %policy_name,
                failures = state.failures.len(),
                re_entries = state.re_entries.len(),
                "Circuit breaker opened"
            );
        } else {
            debug!(
                policy = %policy_name,
                failures = state.failures.len(),
                status = ?state.status,
                "Store failure recorded"
            );
        }

        self.store.save(policy_name, &state).await?;
        Ok(state.status)
    }

    /// Account a successful evaluation for `policy_name`.
    pub async fn report_success(&self, policy_name: &str) -> StoreResult<BreakerStatus> {
        let now = self.clock.now();
        let mut state = self.state(policy_name).await?;
        if state.status == BreakerStatus::Closed {
            return Ok(BreakerStatus::Closed);
        }

        if state.record_success(now, &self.config) {
            info!(policy = %policy_name, "Circuit breaker closed");
        }
        self.store.save(policy_name, &state).await?;
        Ok(state.status)
    }
}
