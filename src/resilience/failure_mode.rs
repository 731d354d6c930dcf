//! Failure-mode resolution.

use super::circuit_breaker::{BreakerSnapshot, BreakerStatus};
use crate::ratelimit::policy::{BlockPolicy, FailureMode};
use crate::ratelimit::types::OperatingMode;

/// Maps breaker health and policy preference to an operating mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureModeResolver;

impl FailureModeResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, policy: &BlockPolicy, breaker: &BreakerSnapshot) -> OperatingMode {
        match breaker.status {
            // Chronic instability overrides whatever the policy prefers.
            BreakerStatus::Open if breaker.re_entry_violated => OperatingMode::FailClosed,
            BreakerStatus::Open => match policy.failure_mode {
                FailureMode::FailOpen => OperatingMode::FailOpen,
                FailureMode::FailClosed => OperatingMode::DegradedMode,
            },
            BreakerStatus::Closed => preferred(policy.failure_mode),
        }
    }
}

fn preferred(mode: FailureMode) -> OperatingMode {
    match mode {
        FailureMode::FailOpen => OperatingMode::FailOpen,
        FailureMode::FailClosed => OperatingMode::FailClosed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: FailureMode) -> BlockPolicy {
        BlockPolicy {
            failure_mode: mode,
            ..BlockPolicy::new("p")
        }
    }

    fn snapshot(status: BreakerStatus, re_entry_violated: bool) -> BreakerSnapshot {
        BreakerSnapshot {
            status,
            re_entry_violated,
        }
    }

    #[test]
    fn test_closed_breaker_uses_policy_preference() {
        let resolver = FailureModeResolver::new();
        let closed = snapshot(BreakerStatus::Closed, false);

        assert_eq!(resolver.resolve(&policy(FailureMode::FailOpen), &closed), OperatingMode::FailOpen);
        assert_eq!(resolver.resolve(&policy(FailureMode::FailClosed), &closed), OperatingMode::FailClosed);
    }

    #[test]
    fn test_open_breaker() {
        let resolver = FailureModeResolver::new();
        let open = snapshot(BreakerStatus::Open, false);

        assert_eq!(resolver.resolve(&policy(FailureMode::FailOpen), &open), OperatingMode::FailOpen);
        assert_eq!(
            resolver.resolve(&policy(FailureMode::FailClosed), &open),
            OperatingMode::DegradedMode
        );
    }

    #[test]
    fn test_re_entry_violation_forces_fail_closed() {
        let resolver = FailureModeResolver::new();
        let unstable = snapshot(BreakerStatus::Open, true);

        assert_eq!(
            resolver.resolve(&policy(FailureMode::FailOpen), &unstable),
            OperatingMode::FailClosed
        );
        assert_eq!(
            resolver.resolve(&policy(FailureMode::FailClosed), &unstable),
            OperatingMode::FailClosed
        );
    }
}
