//! The evaluation pipeline.
//!
//! A single evaluation walks a fixed sequence of stages: key construction,
//! fail-fast block checks, ephemeral resolution, decayed threshold scoring,
//! correlation rules, score mutation and finally block persistence. Store
//! errors are never handled here; they bubble to the engine, which owns
//! circuit-breaker accounting and the degraded-mode fallback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, trace};

use super::decay::DecayCalculator;
use super::keys::{CompositeKeySet, KeyBuilder, KeyType};
use super::ladder::PenaltyLadder;
use super::policy::{deltas, BlockPolicy, PolicyKind};
use super::types::{
    signals, Confidence, DeviceIdentity, OperatingMode, RateLimitContext, RateLimitRequest,
    RateLimitResult, META_KEY, META_SIGNAL,
};
use crate::clock::{elapsed_secs, Clock};
use crate::error::StoreResult;
use crate::guard::{AntiEquilibriumGate, BudgetTracker, EphemeralBucket, EphemeralCheck};
use crate::store::{BlockRecord, CorrelationStore, RateLimitStore};

/// Sliding window for the churn and dilution distinct sets.
const CORRELATION_WINDOW_SECS: u64 = 600;
/// Distinct fingerprints against one IP+UA that count as churn.
const CHURN_FINGERPRINT_LIMIT: u64 = 3;
/// Distinct IPs behind one fingerprint that count as dilution.
const DILUTION_IP_LIMIT: u64 = 6;
/// Lifetime of the dilution warn flag; spans the following window.
const DILUTION_WARN_TTL_SECS: u64 = 2 * CORRELATION_WINDOW_SECS;
/// Distinct devices on one account that open a new-device flood.
const FLOOD_DEVICE_LIMIT: u64 = 6;
const FLOOD_STAGE_TTL_SECS: u64 = 900;
/// Retry hint for a budget fail-fast.
const BUDGET_RETRY_SECS: u64 = 3600;
/// Window for the repeated missing-fingerprint surcharge.
const MISSING_FP_WINDOW_SECS: u64 = 1800;
const NEAR_THRESHOLD_WATCH_TTL_SECS: u64 = 1800;
/// Bound on a cost-scaled delta; integers up to 2^53 survive the f64 trip.
const MAX_SCALED_DELTA: f64 = 9_007_199_254_740_992.0;

/// Key types an `access` delta is applied to.
const ACCESS_KEY_TYPES: [KeyType; 6] = [
    KeyType::K1,
    KeyType::K1_48,
    KeyType::K1_40,
    KeyType::K1_32,
    KeyType::K2,
    KeyType::K3,
];

/// Store-backed collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn RateLimitStore>,
    pub correlation: Arc<dyn CorrelationStore>,
    pub ephemeral: Arc<dyn EphemeralBucket>,
    pub budget: Arc<dyn BudgetTracker>,
    pub equilibrium: Arc<dyn AntiEquilibriumGate>,
}

/// One effective key with its stored and decayed score.
#[derive(Debug)]
struct KeyScore<'a> {
    key_type: KeyType,
    key: &'a str,
    raw: i64,
    decayed: i64,
}

/// Running maximum level across keys, with the key and signal that set it.
#[derive(Debug, Clone, Copy)]
struct Escalation {
    level: u32,
    key_type: KeyType,
    signal: &'static str,
}

impl Escalation {
    fn none() -> Self {
        Self {
            level: 0,
            key_type: KeyType::K1,
            signal: signals::SCORE_ESCALATION,
        }
    }

    fn fold(&mut self, level: u32, key_type: KeyType, signal: &'static str) {
        if level > self.level {
            *self = Self {
                level,
                key_type,
                signal,
            };
        }
    }
}

/// Runs one policy evaluation against the store.
pub struct EvaluationPipeline {
    deps: PipelineDeps,
    keys: KeyBuilder,
    decay: DecayCalculator,
    clock: Arc<dyn Clock>,
    score_ttl_secs: u64,
}

impl EvaluationPipeline {
    pub fn new(
        deps: PipelineDeps,
        keys: KeyBuilder,
        decay: DecayCalculator,
        clock: Arc<dyn Clock>,
        score_ttl_secs: u64,
    ) -> Self {
        Self {
            deps,
            keys,
            decay,
            clock,
            score_ttl_secs,
        }
    }

    /// Evaluate one request.
    pub async fn process(
        &self,
        policy: &BlockPolicy,
        context: &RateLimitContext,
        request: &RateLimitRequest,
        device: &DeviceIdentity,
    ) -> StoreResult<RateLimitResult> {
        let ladder = policy.ladder();
        let keys = self.keys.build(&policy.name, context, device);

        let active = match self.check_active_blocks(&keys).await? {
            ActiveBlocks::Hard(result) => return Ok(result),
            ActiveBlocks::Soft(levels) => levels,
        };

        if let Some(result) = self.check_budget(policy, &keys, device).await? {
            return Ok(result);
        }

        let ephemeral = match device.fingerprint_hash.as_deref() {
            Some(fingerprint) => {
                self.deps
                    .ephemeral
                    .check(context, fingerprint, keys.k4.as_deref())
                    .await?
            }
            None => None,
        };
        let is_ephemeral = ephemeral.is_some_and(|check| check.is_ephemeral);
        let effective = if is_ephemeral {
            trace!("Ephemeral fingerprint, device-scoped keys excluded");
            keys.without_device_scope()
        } else {
            keys.clone()
        };

        let scores = self.fetch_scores(&effective, &active).await?;

        let mut by_score = Escalation::none();
        for score in &scores {
            let level = capped_level(policy, device, score.key_type, score.decayed);
            trace!(
                key_type = %score.key_type,
                raw = score.raw,
                decayed = score.decayed,
                level,
                "Scored key"
            );
            by_score.fold(level, score.key_type, signals::SCORE_THRESHOLD);
        }
        if by_score.level > 0 {
            debug!(
                key_type = %by_score.key_type,
                level = by_score.level,
                "Threshold reached"
            );
            return Ok(verdict(by_score, ladder.duration(by_score.level)));
        }

        if let Some(fingerprint) = device.fingerprint_hash.as_deref() {
            if let Some(result) = self
                .correlate(policy, device, &keys, fingerprint, is_ephemeral, &ladder)
                .await?
            {
                return Ok(result);
            }
        }

        if let Some(check) = ephemeral {
            if let Some(result) = self.check_device_flood(&keys, &effective, check, &ladder).await? {
                return Ok(result);
            }
        }

        if request.is_pre_check {
            return Ok(RateLimitResult::allow(OperatingMode::Normal));
        }

        let mut escalation = self
            .mutate_scores(policy, request, device, &keys, &scores)
            .await?;

        if let (Some(budget), Some(k4)) = (&policy.budget, keys.k4.as_deref()) {
            self.deps.budget.increment(k4).await?;
            if self.deps.budget.is_exceeded(k4, budget.threshold).await? {
                escalation.fold(budget.block_level, KeyType::K4, signals::BUDGET_EXCEEDED);
            }
        }

        if escalation.level == 1 {
            if let Some(k4) = keys.k4.as_deref() {
                self.deps.equilibrium.record_soft_block(k4).await?;
                if self.deps.equilibrium.should_escalate(k4).await? {
                    debug!("Repeated soft blocks, escalating");
                    escalation = Escalation {
                        level: 2,
                        key_type: KeyType::K4,
                        signal: signals::ANTI_EQUILIBRIUM,
                    };
                }
            }
        }

        if escalation.level == 0 {
            return Ok(RateLimitResult::allow(OperatingMode::Normal));
        }

        let duration = ladder.duration(escalation.level);
        self.apply_blocks(policy, device, &keys, &effective, escalation.level, duration)
            .await?;
        debug!(
            key_type = %escalation.key_type,
            level = escalation.level,
            retry_after = duration,
            "Blocked"
        );
        Ok(verdict(escalation, duration))
    }

    async fn check_active_blocks(&self, keys: &CompositeKeySet) -> StoreResult<ActiveBlocks> {
        let entries = keys.entries();
        let blocks = try_join_all(
            entries
                .iter()
                .map(|(_, key)| self.deps.store.check_block(key)),
        )
        .await?;

        let now = self.clock.now();
        let mut levels = HashMap::new();
        for ((key_type, _), block) in entries.iter().zip(blocks) {
            let Some(BlockRecord { level, expires_at }) = block else {
                continue;
            };
            if level >= 2 {
                let remaining = (expires_at - now).num_seconds().max(1) as u64;
                debug!(key_type = %key_type, level, remaining, "Active hard block");
                return Ok(ActiveBlocks::Hard(
                    RateLimitResult::from_level(level, remaining, OperatingMode::Normal)
                        .with_meta(META_SIGNAL, signals::ACTIVE_BLOCK)
                        .with_meta(META_KEY, key_type.as_str()),
                ));
            }
            levels.insert(*key_type, level);
        }
        Ok(ActiveBlocks::Soft(levels))
    }

    async fn check_budget(
        &self,
        policy: &BlockPolicy,
        keys: &CompositeKeySet,
        device: &DeviceIdentity,
    ) -> StoreResult<Option<RateLimitResult>> {
        let (Some(budget), Some(k4)) = (&policy.budget, keys.k4.as_deref()) else {
            return Ok(None);
        };
        if !self.deps.budget.is_exceeded(k4, budget.threshold).await? {
            return Ok(None);
        }

        let mut level = budget.block_level;
        if device.is_trusted_session && level > 2 {
            level -= 1;
        }
        debug!(level, "Budget exhausted");
        Ok(Some(
            RateLimitResult::from_level(level, BUDGET_RETRY_SECS, OperatingMode::Normal)
                .with_meta(META_SIGNAL, signals::BUDGET_EXCEEDED)
                .with_meta(META_KEY, KeyType::K4.as_str()),
        ))
    }

    async fn fetch_scores<'a>(
        &self,
        keys: &'a CompositeKeySet,
        active: &HashMap<KeyType, u32>,
    ) -> StoreResult<Vec<KeyScore<'a>>> {
        let entries = keys.entries();
        let records = try_join_all(entries.iter().map(|(_, key)| self.deps.store.get(key))).await?;

        let now = self.clock.now();
        Ok(entries
            .into_iter()
            .zip(records)
            .map(|((key_type, key), record)| {
                let (raw, decayed) = match record {
                    Some(record) => (
                        record.value,
                        self.decay.decay(
                            record.value,
                            elapsed_secs(record.updated_at, now),
                            active.get(&key_type).copied(),
                            key_type.scope_class(),
                        ),
                    ),
                    None => (0, 0),
                };
                KeyScore {
                    key_type,
                    key,
                    raw,
                    decayed,
                }
            })
            .collect())
    }

    async fn correlate(
        &self,
        policy: &BlockPolicy,
        device: &DeviceIdentity,
        keys: &CompositeKeySet,
        fingerprint: &str,
        is_ephemeral: bool,
        ladder: &PenaltyLadder,
    ) -> StoreResult<Option<RateLimitResult>> {
        let correlation = &self.deps.correlation;

        let fingerprints = correlation
            .add_distinct(&format!("churn:{}", keys.k2), fingerprint, CORRELATION_WINDOW_SECS)
            .await?;
        if fingerprints >= CHURN_FINGERPRINT_LIMIT {
            debug!(fingerprints, "Fingerprint churn");
            return self
                .hard_block(KeyType::K2, &keys.k2, ladder, signals::FINGERPRINT_CHURN)
                .await
                .map(Some);
        }

        // Members are derived k1 keys, so IPv6 hosts count per /64.
        let ips = correlation
            .add_distinct(
                &format!("dilution:{}:{}", policy.name, fingerprint),
                &keys.k1,
                CORRELATION_WINDOW_SECS,
            )
            .await?;
        if ips < DILUTION_IP_LIMIT {
            return Ok(None);
        }

        if device.confidence == Confidence::Low {
            debug!(ips, "IP dilution on low-confidence fingerprint");
            return self
                .hard_block(KeyType::K2, &keys.k2, ladder, signals::IP_DILUTION)
                .await
                .map(Some);
        }

        let warn_key = format!("dilution_warn:{}:{}", policy.name, fingerprint);
        if correlation.get_watch_flag(&warn_key).await? == 0 {
            debug!(ips, "IP dilution warning");
            correlation
                .increment_watch_flag(&warn_key, DILUTION_WARN_TTL_SECS)
                .await?;
            return Ok(None);
        }

        correlation.clear_watch_flag(&warn_key).await?;
        debug!(ips, "IP dilution confirmed");
        let (key_type, key) = match keys.k3.as_deref() {
            Some(k3) if !is_ephemeral => (KeyType::K3, k3),
            _ => (KeyType::K2, keys.k2.as_str()),
        };
        self.hard_block(key_type, key, ladder, signals::IP_DILUTION)
            .await
            .map(Some)
    }

    async fn check_device_flood(
        &self,
        keys: &CompositeKeySet,
        effective: &CompositeKeySet,
        check: EphemeralCheck,
        ladder: &PenaltyLadder,
    ) -> StoreResult<Option<RateLimitResult>> {
        let Some(k4) = keys.k4.as_deref() else {
            return Ok(None);
        };
        if check.account_device_count < FLOOD_DEVICE_LIMIT || !check.is_new_device {
            return Ok(None);
        }

        let stage_key = format!("flood:{}", k4);
        if self.deps.correlation.get_watch_flag(&stage_key).await? > 0 {
            // An ephemeral fingerprint has no k5; its IP+UA takes the block.
            let (key_type, key) = match effective.k5.as_deref() {
                Some(k5) => (KeyType::K5, k5),
                None => (KeyType::K2, keys.k2.as_str()),
            };
            debug!(devices = check.account_device_count, "New-device flood");
            return self
                .hard_block(key_type, key, ladder, signals::NEW_DEVICE_FLOOD)
                .await
                .map(Some);
        }

        debug!(devices = check.account_device_count, "Entering new-device flood stage");
        self.deps
            .correlation
            .increment_watch_flag(&stage_key, FLOOD_STAGE_TTL_SECS)
            .await?;
        let duration = ladder.duration(1);
        self.deps.store.block(k4, 1, duration).await?;
        Ok(Some(verdict(
            Escalation {
                level: 1,
                key_type: KeyType::K4,
                signal: signals::NEW_DEVICE_FLOOD,
            },
            duration,
        )))
    }

    /// Apply this request's deltas and return the highest resulting level.
    async fn mutate_scores(
        &self,
        policy: &BlockPolicy,
        request: &RateLimitRequest,
        device: &DeviceIdentity,
        keys: &CompositeKeySet,
        scores: &[KeyScore<'_>],
    ) -> StoreResult<Escalation> {
        let mut escalation = Escalation::none();
        let access = policy.delta(deltas::ACCESS);
        if !request.is_failure && access.is_none() {
            return Ok(escalation);
        }

        let mut pending = PendingDeltas::default();
        if let Some(access) = access {
            let delta = scaled_delta(access, request.cost);
            for key_type in ACCESS_KEY_TYPES {
                pending.add(key_type, delta);
            }
        }

        if request.is_failure {
            let per_key = [
                (KeyType::K5, deltas::K5_FAILURE),
                (KeyType::K4, deltas::K4_FAILURE),
                (KeyType::K3, deltas::K3_FAILURE),
                (KeyType::K2, deltas::K2_FAILURE),
            ];
            for (key_type, name) in per_key {
                if let Some(delta) = policy.delta(name) {
                    pending.add(key_type, delta);
                }
            }
            if let Some(delta) = policy.delta(deltas::K1_FAILURE) {
                pending.add_network(delta);
            }

            let missing_fp = device.fingerprint_hash.is_none();
            if missing_fp {
                if let Some(delta) = policy.delta(deltas::K2_MISSING_FP) {
                    pending.add(KeyType::K2, delta);
                }
            }
            if keys.k4.is_some() {
                if let Some(delta) = policy.delta(deltas::K1_SPRAY) {
                    pending.add_network(delta);
                }
            }
            if let (true, Some(k4), Some(delta)) = (
                missing_fp,
                keys.k4.as_deref(),
                policy.delta(deltas::K4_REPEATED_MISSING_FP),
            ) {
                let last_seen_key = format!("missing_fp:{}", k4);
                if self.deps.store.get(&last_seen_key).await?.is_some() {
                    pending.add(KeyType::K4, delta);
                }
                let now = self.clock.now().timestamp();
                self.deps
                    .store
                    .set(&last_seen_key, now, MISSING_FP_WINDOW_SECS)
                    .await?;
            }
        }

        for score in scores {
            let delta = pending.get(score.key_type);
            if delta == 0 {
                continue;
            }

            let net = score.decayed.saturating_add(delta).saturating_sub(score.raw);
            let value = self
                .deps
                .store
                .increment(score.key, self.score_ttl_secs, net)
                .await?;
            let level = capped_level(policy, device, score.key_type, value);
            trace!(key_type = %score.key_type, delta, value, level, "Score updated");
            escalation.fold(level, score.key_type, signals::SCORE_ESCALATION);

            if let Some((threshold, threshold_level)) =
                policy.threshold_just_above(score.key_type, value)
            {
                let watch_key = format!("n1:{}:{}", score.key, threshold);
                let hits = self
                    .deps
                    .correlation
                    .increment_watch_flag(&watch_key, NEAR_THRESHOLD_WATCH_TTL_SECS)
                    .await?;
                if hits >= 2 {
                    let level = capped_level(policy, device, score.key_type, threshold);
                    debug!(
                        key_type = %score.key_type,
                        threshold,
                        level = threshold_level,
                        "Repeated near-threshold score"
                    );
                    escalation.fold(level, score.key_type, signals::NEAR_THRESHOLD_REPEAT);
                }
            }
        }
        Ok(escalation)
    }

    async fn apply_blocks(
        &self,
        policy: &BlockPolicy,
        device: &DeviceIdentity,
        keys: &CompositeKeySet,
        effective: &CompositeKeySet,
        level: u32,
        duration: u64,
    ) -> StoreResult<()> {
        let store = &self.deps.store;
        if let Some(k4) = keys.k4.as_deref() {
            store.block(k4, level, duration).await?;
        }
        if policy.kind() == PolicyKind::ApiHeavy {
            store.block(&keys.k1, level, duration).await?;
            store.block(&keys.k2, level, duration).await?;
            // Low-confidence devices are covered by the k2 block alone.
            if let (Some(k3), false) = (effective.k3.as_deref(), device.confidence == Confidence::Low)
            {
                store.block(k3, level, duration).await?;
            }
        }
        Ok(())
    }

    /// Persist a ladder level 2 block on one key and report it.
    async fn hard_block(
        &self,
        key_type: KeyType,
        key: &str,
        ladder: &PenaltyLadder,
        signal: &'static str,
    ) -> StoreResult<RateLimitResult> {
        let duration = ladder.duration(2);
        self.deps.store.block(key, 2, duration).await?;
        Ok(verdict(
            Escalation {
                level: 2,
                key_type,
                signal,
            },
            duration,
        ))
    }
}

/// Per key type score deltas accumulated for one request.
#[derive(Debug, Default)]
struct PendingDeltas(BTreeMap<KeyType, i64>);

impl PendingDeltas {
    fn add(&mut self, key_type: KeyType, delta: i64) {
        let total = self.0.entry(key_type).or_insert(0);
        *total = total.saturating_add(delta);
    }

    /// k1 deltas also land on the IPv6 network variants.
    fn add_network(&mut self, delta: i64) {
        for key_type in [KeyType::K1, KeyType::K1_48, KeyType::K1_40, KeyType::K1_32] {
            self.add(key_type, delta);
        }
    }

    fn get(&self, key_type: KeyType) -> i64 {
        self.0.get(&key_type).copied().unwrap_or(0)
    }
}

enum ActiveBlocks {
    Hard(RateLimitResult),
    /// Levels of active soft blocks, by key type
    Soft(HashMap<KeyType, u32>),
}

/// `delta * cost`, rounded. NaN and negative costs count as zero.
fn scaled_delta(delta: i64, cost: f64) -> i64 {
    let scaled = (delta as f64 * cost.max(0.0)).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(-MAX_SCALED_DELTA, MAX_SCALED_DELTA) as i64
}

/// Threshold level for a key, with LOW-confidence k3 never above 1.
fn capped_level(policy: &BlockPolicy, device: &DeviceIdentity, key_type: KeyType, score: i64) -> u32 {
    let level = policy.level_for(key_type, score);
    if key_type == KeyType::K3 && device.confidence == Confidence::Low {
        level.min(1)
    } else {
        level
    }
}

fn verdict(escalation: Escalation, duration: u64) -> RateLimitResult {
    RateLimitResult::from_level(escalation.level, duration, OperatingMode::Normal)
        .with_meta(META_SIGNAL, escalation.signal)
        .with_meta(META_KEY, escalation.key_type.as_str())
}
