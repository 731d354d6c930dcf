//! End-to-end scenarios driving the engine with a manual clock and the
//! in-memory stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use adaptive_ratelimit::clock::ManualClock;
use adaptive_ratelimit::config::RateLimiterConfig;
use adaptive_ratelimit::device::{DeviceIdentityResolver, HintDeviceResolver};
use adaptive_ratelimit::ratelimit::{
    Backends, BlockPolicy, CompositeKeySet, Decision, FailureMode, KeyBuilder, OperatingMode,
    PolicySet, RateLimitContext, RateLimitRequest, RateLimitResult, RateLimiterEngine,
};
use adaptive_ratelimit::resilience::BreakerStatus;
use adaptive_ratelimit::store::{MemoryCircuitBreakerStore, MemoryStore, RateLimitStore};

const SECRET: &str = "scenario-secret";
const MEDIUM_HINT: &str = "canvas:3f9a;webgl:ab12";

struct Scenario {
    engine: RateLimiterEngine,
    store: Arc<MemoryStore>,
    clock: ManualClock,
}

impl Scenario {
    fn new(policies: Vec<BlockPolicy>) -> Self {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let backends = Backends {
            store: store.clone(),
            correlation: store.clone(),
            breaker_store: Arc::new(MemoryCircuitBreakerStore::new()),
        };
        let engine = RateLimiterEngine::new(
            &RateLimiterConfig::with_secret(SECRET),
            PolicySet::from_policies(policies).unwrap(),
            backends,
            Arc::new(HintDeviceResolver::new()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self {
            engine,
            store,
            clock,
        }
    }

    async fn limit(&self, context: &RateLimitContext, request: &RateLimitRequest) -> RateLimitResult {
        let result = self.engine.limit(context, request).await.unwrap();
        assert_eq!(
            result.decision,
            Decision::from_level(result.level),
            "decision must follow level: {:?}",
            result
        );
        result
    }

    fn keys(&self, policy: &str, context: &RateLimitContext) -> CompositeKeySet {
        let device = HintDeviceResolver::new().resolve(context);
        KeyBuilder::new(SECRET).build(policy, context, &device)
    }
}

fn policy(
    name: &str,
    failure_mode: FailureMode,
    thresholds: &[(i64, u32)],
    deltas: &[(&str, i64)],
) -> BlockPolicy {
    let mut policy = BlockPolicy::new(name);
    policy.failure_mode = failure_mode;
    policy.score_thresholds.insert(
        "default".to_string(),
        thresholds.iter().copied().collect::<BTreeMap<_, _>>(),
    );
    policy.score_deltas = deltas.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    policy
}

fn login_policy() -> BlockPolicy {
    policy(
        "login_protection",
        FailureMode::FailClosed,
        &[(10, 1), (20, 2)],
        &[("k4_failure", 2), ("k1_failure", 1)],
    )
}

#[tokio::test]
async fn login_store_outage_on_third_attempt_fails_closed() {
    let s = Scenario::new(vec![login_policy()]);
    let ctx = RateLimitContext::new("192.0.2.10", "Mozilla/5.0", Some(1001));
    let failure = RateLimitRequest::new("login_protection").failure();

    for _ in 0..2 {
        let result = s.limit(&ctx, &failure).await;
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.mode, OperatingMode::Normal);
    }

    s.clock.advance_secs(3);
    s.store.set_available(false);
    let result = s.limit(&ctx, &failure).await;

    assert_eq!(result.decision, Decision::HardBlock);
    assert_eq!(result.level, 2);
    assert_eq!(result.mode, OperatingMode::FailClosed);
    assert_eq!(result.retry_after_seconds, 600);
}

#[tokio::test]
async fn medium_confidence_dilution_confirms_on_second_window() {
    let s = Scenario::new(vec![login_policy()]);
    let request = RateLimitRequest::new("login_protection");
    let from = |octet: u8| {
        RateLimitContext::new(format!("198.51.100.{}", octet), "Mozilla/5.0", None)
            .with_device_hint(MEDIUM_HINT)
    };

    for octet in 1..=6 {
        let result = s.limit(&from(octet), &request).await;
        assert_eq!(result.decision, Decision::Allow, "first window, ip {}", octet);
    }

    s.clock.advance_secs(11 * 60);
    for octet in 21..=25 {
        assert!(s.limit(&from(octet), &request).await.is_allowed());
    }
    let result = s.limit(&from(26), &request).await;

    assert_eq!(result.decision, Decision::HardBlock);
    assert_eq!(result.level, 2);
    assert_eq!(result.retry_after_seconds, 60);

    let k3 = s.keys("login_protection", &from(26)).k3.unwrap();
    assert_eq!(s.store.check_block(&k3).await.unwrap().unwrap().level, 2);
}

#[tokio::test]
async fn fingerprint_churn_on_one_ip_and_user_agent() {
    let s = Scenario::new(vec![login_policy()]);
    let request = RateLimitRequest::new("login_protection");
    let with_hint = |hint: &str| {
        RateLimitContext::new("203.0.113.7", "Mozilla/5.0", None).with_device_hint(hint)
    };

    assert!(s.limit(&with_hint("fingerprint-alpha-0001"), &request).await.is_allowed());
    assert!(s.limit(&with_hint("fingerprint-bravo-0002"), &request).await.is_allowed());
    let result = s.limit(&with_hint("fingerprint-charlie-03"), &request).await;

    assert_eq!(result.decision, Decision::HardBlock);
    assert_eq!(result.level, 2);
    assert_eq!(result.retry_after_seconds, 60);

    // The IP+UA block now stops any fingerprint on that pair.
    let next = s.limit(&with_hint("fingerprint-delta-0004"), &request).await;
    assert_eq!(next.decision, Decision::HardBlock);
}

#[tokio::test]
async fn ephemeral_fingerprint_creates_no_device_state() {
    let s = Scenario::new(vec![policy(
        "standard",
        FailureMode::FailOpen,
        &[(10, 1), (20, 2)],
        &[("access", 2), ("k3_failure", 6), ("k5_failure", 6), ("k4_failure", 6)],
    )]);
    let hint = "rotating-fingerprint-under-many-agents";
    let failure = RateLimitRequest::new("standard").failure();

    let stable = RateLimitContext::new("192.0.2.50", "AgentOne/1.0", None).with_device_hint(hint);
    s.limit(&stable, &failure).await;
    let second =
        RateLimitContext::new("192.0.2.50", "AgentTwo/1.0", None).with_device_hint(hint);
    s.limit(&second, &failure).await;
    assert!(s.store.has_state_for(&s.keys("standard", &stable).k3.unwrap()));

    // A third user agent marks the fingerprint ephemeral.
    let ephemeral =
        RateLimitContext::new("192.0.2.77", "AgentThree/1.0", Some(555)).with_device_hint(hint);
    for _ in 0..4 {
        s.limit(&ephemeral, &failure).await;
    }

    let keys = s.keys("standard", &ephemeral);
    assert!(!s.store.has_state_for(&keys.k3.unwrap()));
    assert!(!s.store.has_state_for(&keys.k5.unwrap()));
    assert!(s.store.has_state_for(&keys.k4.unwrap()));
    assert!(s.store.has_state_for(&keys.k2));
}

#[tokio::test]
async fn pre_checks_are_idempotent() {
    let s = Scenario::new(vec![login_policy()]);
    let ctx = RateLimitContext::new("192.0.2.20", "Mozilla/5.0", Some(7))
        .with_device_hint(MEDIUM_HINT);
    let pre_check = RateLimitRequest::new("login_protection").pre_check().failure();

    let first = s.limit(&ctx, &pre_check).await;
    for _ in 0..25 {
        assert_eq!(s.limit(&ctx, &pre_check).await, first);
    }

    let keys = s.keys("login_protection", &ctx);
    for (key_type, key) in keys.entries() {
        assert!(
            s.store.get(key).await.unwrap().is_none(),
            "{} was scored by a pre-check",
            key_type
        );
    }
}

#[tokio::test]
async fn low_confidence_device_score_never_hard_blocks() {
    let s = Scenario::new(vec![login_policy()]);
    let ctx = RateLimitContext::new("192.0.2.30", "Mozilla/5.0", None).with_device_hint("weak");
    let k3 = s.keys("login_protection", &ctx).k3.unwrap();
    s.store.set(&k3, i64::MAX / 2, 86_400).await.unwrap();

    let result = s.limit(&ctx, &RateLimitRequest::new("login_protection")).await;
    assert_eq!(result.decision, Decision::SoftBlock);
    assert_eq!(result.level, 1);
}

#[tokio::test]
async fn repeated_breaker_trips_force_fail_closed() {
    let s = Scenario::new(vec![policy("standard", FailureMode::FailOpen, &[(10, 1)], &[])]);
    let ctx = RateLimitContext::new("192.0.2.40", "Mozilla/5.0", None);
    let request = RateLimitRequest::new("standard");

    for trip in 0..2 {
        s.store.set_available(false);
        for _ in 0..3 {
            let result = s.limit(&ctx, &request).await;
            assert_eq!(result.mode, OperatingMode::FailOpen, "trip {}", trip);
        }
        s.store.set_available(true);
        s.clock.advance_secs(300);
        assert_eq!(s.limit(&ctx, &request).await.mode, OperatingMode::Normal);
        assert_eq!(
            s.engine.circuit_breaker().status("standard").await.unwrap(),
            BreakerStatus::Closed
        );
    }

    s.store.set_available(false);
    let mut last = None;
    for _ in 0..3 {
        last = Some(s.limit(&ctx, &request).await);
    }
    let result = last.unwrap();

    assert_eq!(result.mode, OperatingMode::FailClosed);
    assert_eq!(result.decision, Decision::HardBlock);
    assert_eq!(result.retry_after_seconds, 600);
    assert_eq!(
        result.metadata.get("signal").map(String::as_str),
        Some("CRITICAL_RE_ENTRY_VIOLATION")
    );
}

#[tokio::test]
async fn breaker_waits_for_degraded_and_healthy_intervals() {
    let s = Scenario::new(vec![policy("standard", FailureMode::FailOpen, &[(10, 1)], &[])]);
    let ctx = RateLimitContext::new("192.0.2.60", "Mozilla/5.0", None);
    let request = RateLimitRequest::new("standard");
    let status = || async { s.engine.circuit_breaker().status("standard").await.unwrap() };

    s.store.set_available(false);
    for _ in 0..3 {
        s.limit(&ctx, &request).await;
    }
    assert_eq!(status().await, BreakerStatus::Open);

    // A late failure restarts the healthy interval.
    s.clock.advance_secs(250);
    s.limit(&ctx, &request).await;
    s.store.set_available(true);

    s.clock.advance_secs(50);
    s.limit(&ctx, &request).await;
    assert_eq!(status().await, BreakerStatus::Open);

    s.clock.advance_secs(69);
    s.limit(&ctx, &request).await;
    assert_eq!(status().await, BreakerStatus::Open);

    s.clock.advance_secs(1);
    s.limit(&ctx, &request).await;
    assert_eq!(status().await, BreakerStatus::Closed);
}

#[tokio::test]
async fn unknown_policy_is_not_a_verdict() {
    let s = Scenario::new(vec![login_policy()]);
    let ctx = RateLimitContext::new("192.0.2.1", "Mozilla/5.0", None);

    let result = s.engine.limit(&ctx, &RateLimitRequest::new("signup_protection")).await;
    tokio_test::assert_err!(result);
}
