//! The rate limiter façade.
//!
//! [`RateLimiterEngine::limit`] is the single entry point callers use. It
//! resolves the policy and device, runs the [`EvaluationPipeline`], and owns
//! what happens when the store misbehaves: circuit-breaker accounting,
//! failure-mode resolution and the local fallback limiter.

use std::sync::Arc;

use tracing::{debug, error, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::decay::DecayCalculator;
use super::keys::KeyBuilder;
use super::pipeline::{EvaluationPipeline, PipelineDeps};
use super::policy::{BlockPolicy, PolicySet};
use super::types::{
    signals, OperatingMode, RateLimitContext, RateLimitRequest, RateLimitResult, META_SIGNAL,
};
use crate::clock::Clock;
use crate::config::RateLimiterConfig;
use crate::device::DeviceIdentityResolver;
use crate::error::{RateLimiterError, Result, StoreError};
use crate::guard::{CorrelationEphemeralBucket, CorrelationEquilibriumGate, StoreBudgetTracker};
use crate::resilience::{
    BreakerSnapshot, BreakerStatus, CircuitBreaker, FailureModeResolver, LocalFallbackLimiter,
};
use crate::store::{
    CircuitBreakerStore, CorrelationStore, MemoryCircuitBreakerStore, MemoryStore, RateLimitStore,
};

/// Level and retry of the verdict issued when failing closed.
const FAIL_CLOSED_LEVEL: u32 = 2;
const FAIL_CLOSED_RETRY_SECS: u64 = 600;

/// The stores an engine runs against.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn RateLimitStore>,
    pub correlation: Arc<dyn CorrelationStore>,
    pub breaker_store: Arc<dyn CircuitBreakerStore>,
}

impl Backends {
    /// Process-local stores; scores are not shared between instances.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::from_memory(Arc::new(MemoryStore::new(clock)))
    }

    /// Serve scores and correlation state from one [`MemoryStore`].
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            store: store.clone(),
            correlation: store,
            breaker_store: Arc::new(MemoryCircuitBreakerStore::new()),
        }
    }
}

/// Evaluates requests against named block policies.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiterEngine {
    policies: PolicySet,
    resolver: Arc<dyn DeviceIdentityResolver>,
    pipeline: EvaluationPipeline,
    breaker: CircuitBreaker,
    failure_modes: FailureModeResolver,
    fallback: LocalFallbackLimiter,
}

impl RateLimiterEngine {
    /// Build an engine with the store-backed guard implementations.
    pub fn new(
        config: &RateLimiterConfig,
        policies: PolicySet,
        backends: Backends,
        resolver: Arc<dyn DeviceIdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if policies.is_empty() {
            return Err(RateLimiterError::Config(
                "at least one policy must be configured".to_string(),
            ));
        }

        let deps = PipelineDeps {
            store: backends.store.clone(),
            correlation: backends.correlation.clone(),
            ephemeral: Arc::new(CorrelationEphemeralBucket::new(
                backends.correlation.clone(),
                config.ephemeral.clone(),
            )),
            budget: Arc::new(StoreBudgetTracker::new(
                backends.store.clone(),
                config.budget.clone(),
            )),
            equilibrium: Arc::new(CorrelationEquilibriumGate::new(
                backends.correlation.clone(),
                config.equilibrium.clone(),
            )),
        };
        let pipeline = EvaluationPipeline::new(
            deps,
            KeyBuilder::new(&config.keys.secret),
            DecayCalculator::new(config.scores.decay()),
            clock.clone(),
            config.scores.ttl_secs,
        );
        let breaker = CircuitBreaker::new(
            backends.breaker_store,
            clock.clone(),
            config.circuit_breaker.clone(),
        );
        let fallback = LocalFallbackLimiter::new(config.fallback.clone(), clock);

        Ok(Self::from_parts(policies, resolver, pipeline, breaker, fallback))
    }

    /// Assemble an engine from already-built components, e.g. a pipeline
    /// wired to custom guard implementations.
    pub fn from_parts(
        policies: PolicySet,
        resolver: Arc<dyn DeviceIdentityResolver>,
        pipeline: EvaluationPipeline,
        breaker: CircuitBreaker,
        fallback: LocalFallbackLimiter,
    ) -> Self {
        Self {
            policies,
            resolver,
            pipeline,
            breaker,
            failure_modes: FailureModeResolver::new(),
            fallback,
        }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Evaluate one request.
    ///
    /// The only error is an unknown policy name. Store failures never
    /// surface here; they produce a fallback verdict instead.
    pub async fn limit(
        &self,
        context: &RateLimitContext,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResult> {
        let policy = self
            .policies
            .get(&request.policy_name)
            .ok_or_else(|| RateLimiterError::UnknownPolicy(request.policy_name.clone()))?;

        let span = info_span!(
            "evaluate",
            evaluation_id = %Uuid::new_v4(),
            policy = %policy.name,
        );
        Ok(self.evaluate(policy, context, request).instrument(span).await)
    }

    async fn evaluate(
        &self,
        policy: &BlockPolicy,
        context: &RateLimitContext,
        request: &RateLimitRequest,
    ) -> RateLimitResult {
        let device = self.resolver.resolve(context);
        trace!(
            confidence = ?device.confidence,
            has_fingerprint = device.fingerprint_hash.is_some(),
            pre_check = request.is_pre_check,
            failure = request.is_failure,
            "Evaluating"
        );

        match self.pipeline.process(policy, context, request, &device).await {
            Ok(result) => {
                if let Err(e) = self.breaker.report_success(&policy.name).await {
                    warn!(error = %e, "Failed to record store success");
                }
                debug!(
                    decision = ?result.decision,
                    level = result.level,
                    retry_after = result.retry_after_seconds,
                    "Evaluated"
                );
                result
            }
            Err(e) => self.fall_back(policy, context, e).await,
        }
    }

    async fn fall_back(
        &self,
        policy: &BlockPolicy,
        context: &RateLimitContext,
        cause: StoreError,
    ) -> RateLimitResult {
        warn!(error = %cause, "Store failure during evaluation");

        let snapshot = match self.breaker.report_failure(&policy.name).await {
            Ok(_) => self.breaker.snapshot(&policy.name).await,
            Err(e) => Err(e),
        }
        .unwrap_or_else(|e| {
            warn!(error = %e, "Circuit breaker state unavailable, assuming open");
            BreakerSnapshot::unknown()
        });

        let mode = self.failure_modes.resolve(policy, &snapshot);
        let re_entry_violated = snapshot.status == BreakerStatus::Open && snapshot.re_entry_violated;
        if re_entry_violated {
            error!(
                breaker_status = ?snapshot.status,
                "Circuit breaker re-entry guard violated, failing closed"
            );
        }

        let result = match mode {
            OperatingMode::FailClosed => RateLimitResult::from_level(
                FAIL_CLOSED_LEVEL,
                FAIL_CLOSED_RETRY_SECS,
                mode,
            )
            .with_meta(META_SIGNAL, signals::STORE_UNAVAILABLE),
            _ => {
                let ua = self.resolver.normalize_user_agent(&context.user_agent);
                if self.fallback.allow(policy, mode, context, &ua) {
                    RateLimitResult::allow(mode).with_meta(META_SIGNAL, signals::STORE_UNAVAILABLE)
                } else {
                    warn!(mode = %mode, "Local fallback limit reached");
                    RateLimitResult::from_level(
                        FAIL_CLOSED_LEVEL,
                        self.fallback.config().deny_retry_secs,
                        mode,
                    )
                    .with_meta(META_SIGNAL, signals::LOCAL_FALLBACK_LIMIT)
                }
            }
        };

        if re_entry_violated {
            result.with_meta(META_SIGNAL, signals::CRITICAL_RE_ENTRY_VIOLATION)
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::HintDeviceResolver;
    use crate::ratelimit::policy::FailureMode;
    use crate::ratelimit::types::Decision;

    fn engine_with(policies: Vec<BlockPolicy>) -> (RateLimiterEngine, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let backends = Backends {
            store: store.clone(),
            correlation: store.clone(),
            breaker_store: Arc::new(MemoryCircuitBreakerStore::new()),
        };
        let engine = RateLimiterEngine::new(
            &RateLimiterConfig::with_secret("engine-test"),
            PolicySet::from_policies(policies).unwrap(),
            backends,
            Arc::new(HintDeviceResolver::new()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (engine, store, clock)
    }

    fn policy(name: &str, mode: FailureMode) -> BlockPolicy {
        let mut policy = BlockPolicy::new(name);
        policy.failure_mode = mode;
        policy
    }

    #[tokio::test]
    async fn test_unknown_policy_is_an_error() {
        let (engine, _, _) = engine_with(vec![policy("standard", FailureMode::FailOpen)]);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);

        let err = engine
            .limit(&ctx, &RateLimitRequest::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimiterError::UnknownPolicy(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_healthy_store_reports_normal_mode() {
        let (engine, _, _) = engine_with(vec![policy("standard", FailureMode::FailClosed)]);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);

        let result = tokio_test::assert_ok!(engine.limit(&ctx, &RateLimitRequest::new("standard")).await);
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.mode, OperatingMode::Normal);
    }

    #[tokio::test]
    async fn test_store_failure_with_fail_closed_preference() {
        let (engine, store, _) = engine_with(vec![policy("standard", FailureMode::FailClosed)]);
        store.set_available(false);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);

        let result = engine.limit(&ctx, &RateLimitRequest::new("standard")).await.unwrap();
        assert_eq!(result.decision, Decision::HardBlock);
        assert_eq!(result.level, 2);
        assert_eq!(result.retry_after_seconds, 600);
        assert_eq!(result.mode, OperatingMode::FailClosed);
    }

    #[tokio::test]
    async fn test_store_failure_with_fail_open_preference_allows() {
        let (engine, store, _) = engine_with(vec![policy("standard", FailureMode::FailOpen)]);
        store.set_available(false);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);

        for _ in 0..10 {
            let result = engine.limit(&ctx, &RateLimitRequest::new("standard")).await.unwrap();
            assert!(result.is_allowed());
            assert_eq!(result.mode, OperatingMode::FailOpen);
        }
        assert_eq!(
            engine.circuit_breaker().status("standard").await.unwrap(),
            BreakerStatus::Open
        );
    }

    #[tokio::test]
    async fn test_degraded_login_is_capped_locally() {
        let (engine, store, _) = engine_with(vec![policy("login_protection", FailureMode::FailClosed)]);
        store.set_available(false);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", Some(42));
        let request = RateLimitRequest::new("login_protection");

        // Closed breaker honors FAIL_CLOSED; the third failure trips it into degraded mode.
        for _ in 0..2 {
            let result = engine.limit(&ctx, &request).await.unwrap();
            assert_eq!(result.mode, OperatingMode::FailClosed);
        }

        let mut verdicts = Vec::new();
        for _ in 0..4 {
            verdicts.push(engine.limit(&ctx, &request).await.unwrap());
        }
        assert!(verdicts.iter().all(|r| r.mode == OperatingMode::DegradedMode));
        assert!(verdicts[..3].iter().all(RateLimitResult::is_allowed));
        assert_eq!(verdicts[3].decision, Decision::HardBlock);
        assert_eq!(
            verdicts[3].metadata.get(META_SIGNAL).map(String::as_str),
            Some(signals::LOCAL_FALLBACK_LIMIT)
        );
    }

    #[tokio::test]
    async fn test_fail_open_api_heavy_is_still_capped_locally() {
        let (engine, store, _) =
            engine_with(vec![policy("api_heavy_protection", FailureMode::FailOpen)]);
        store.set_available(false);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);
        let request = RateLimitRequest::new("api_heavy_protection");

        // 120 per IP+UA within the reset interval, whether or not the breaker has tripped.
        for i in 0..120 {
            let result = engine.limit(&ctx, &request).await.unwrap();
            assert!(result.is_allowed(), "request {}", i);
            assert_eq!(result.mode, OperatingMode::FailOpen);
        }

        let denied = engine.limit(&ctx, &request).await.unwrap();
        assert_eq!(denied.mode, OperatingMode::FailOpen);
        assert_eq!(denied.decision, Decision::HardBlock);
        assert_eq!(denied.retry_after_seconds, 600);
        assert_eq!(
            denied.metadata.get(META_SIGNAL).map(String::as_str),
            Some(signals::LOCAL_FALLBACK_LIMIT)
        );
    }

    #[tokio::test]
    async fn test_recovery_closes_breaker_after_quiet_period() {
        let (engine, store, clock) = engine_with(vec![policy("standard", FailureMode::FailOpen)]);
        let ctx = RateLimitContext::new("192.0.2.1", "ua", None);
        let request = RateLimitRequest::new("standard");

        store.set_available(false);
        for _ in 0..3 {
            engine.limit(&ctx, &request).await.unwrap();
        }
        store.set_available(true);

        engine.limit(&ctx, &request).await.unwrap();
        assert_eq!(engine.circuit_breaker().status("standard").await.unwrap(), BreakerStatus::Open);

        clock.advance_secs(300);
        let result = engine.limit(&ctx, &request).await.unwrap();
        assert_eq!(result.mode, OperatingMode::Normal);
        assert_eq!(engine.circuit_breaker().status("standard").await.unwrap(), BreakerStatus::Closed);
    }

    #[test]
    fn test_requires_policies() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let result = RateLimiterEngine::new(
            &RateLimiterConfig::with_secret("x"),
            PolicySet::new(),
            Backends::in_memory(clock.clone()),
            Arc::new(HintDeviceResolver::new()),
            clock,
        );
        assert!(matches!(result, Err(RateLimiterError::Config(_))));
    }
}
