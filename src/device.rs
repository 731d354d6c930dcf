//! Device identity resolution.
//!
//! The engine treats a [`DeviceIdentity`] as opaque input. [`HintDeviceResolver`]
//! is a minimal resolver deriving the fingerprint from client-supplied hint
//! material; deployments with a richer fingerprinting service plug in their
//! own [`DeviceIdentityResolver`].

use sha2::{Digest, Sha256};

use crate::ratelimit::types::{Confidence, DeviceIdentity, RateLimitContext};

/// Maximum length of a normalized user agent.
const MAX_UA_LEN: usize = 256;

/// Hints shorter than this carry little entropy.
const MEDIUM_CONFIDENCE_HINT_LEN: usize = 16;
const HIGH_CONFIDENCE_HINT_LEN: usize = 64;

/// Port for resolving the device behind a request.
pub trait DeviceIdentityResolver: Send + Sync {
    fn resolve(&self, context: &RateLimitContext) -> DeviceIdentity;

    /// Normalize a raw user agent without full resolution.
    fn normalize_user_agent(&self, raw: &str) -> String {
        normalize_user_agent(raw)
    }
}

/// Resolver hashing `RateLimitContext::device_hint` into a fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct HintDeviceResolver;

impl HintDeviceResolver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceIdentityResolver for HintDeviceResolver {
    fn resolve(&self, context: &RateLimitContext) -> DeviceIdentity {
        let hint = context
            .device_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty());

        let confidence = match hint.map(str::len) {
            Some(len) if len >= HIGH_CONFIDENCE_HINT_LEN => Confidence::High,
            Some(len) if len >= MEDIUM_CONFIDENCE_HINT_LEN => Confidence::Medium,
            _ => Confidence::Low,
        };

        DeviceIdentity {
            normalized_ua: normalize_user_agent(&context.user_agent),
            fingerprint_hash: hint.map(|hint| hex::encode(Sha256::digest(hint.as_bytes()))),
            confidence,
            is_trusted_session: context.trusted_session,
        }
    }
}

/// Lowercase, collapse whitespace, keep only the major component of
/// `product/1.2.3` version tokens and cap the length.
pub fn normalize_user_agent(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len().min(MAX_UA_LEN));
    for (i, token) in raw.split_whitespace().enumerate() {
        if i > 0 {
            normalized.push(' ');
        }
        let token = token.to_lowercase();
        match token.split_once('/') {
            Some((product, version)) => {
                normalized.push_str(product);
                normalized.push('/');
                let major = version.split('.').next().unwrap_or_default();
                normalized.push_str(major);
            }
            None => normalized.push_str(&token),
        }
    }

    if normalized.len() > MAX_UA_LEN {
        let mut cut = MAX_UA_LEN;
        while !normalized.is_char_boundary(cut) {
            cut -= 1;
        }
        normalized.truncate(cut);
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_user_agent() {
        assert_eq!(
            normalize_user_agent("  Mozilla/5.0 (X11;  Linux x86_64)   Firefox/128.0.1 "),
            "mozilla/5 (x11; linux x86_64) firefox/128"
        );
        assert_eq!(normalize_user_agent(""), "");
    }

    #[test]
    fn test_minor_versions_normalize_together() {
        assert_eq!(
            normalize_user_agent("Chrome/120.0.6099.71"),
            normalize_user_agent("Chrome/120.0.6099.109")
        );
    }

    #[test]
    fn test_normalize_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(normalize_user_agent(&long).len(), MAX_UA_LEN);
    }

    #[test]
    fn test_resolve_without_hint() {
        let resolver = HintDeviceResolver::new();
        let identity = resolver.resolve(&RateLimitContext::new("192.0.2.1", "Agent/1.2", None));

        assert!(identity.fingerprint_hash.is_none());
        assert_eq!(identity.confidence, Confidence::Low);
        assert_eq!(identity.normalized_ua, "agent/1");
    }

    #[test]
    fn test_resolve_confidence_from_hint_length() {
        let resolver = HintDeviceResolver::new();
        let ctx = |hint: &str| RateLimitContext::new("192.0.2.1", "ua", None).with_device_hint(hint);

        assert_eq!(resolver.resolve(&ctx("short")).confidence, Confidence::Low);
        assert_eq!(resolver.resolve(&ctx(&"m".repeat(20))).confidence, Confidence::Medium);
        assert_eq!(resolver.resolve(&ctx(&"h".repeat(64))).confidence, Confidence::High);

        let a = resolver.resolve(&ctx("canvas-hash-abcdef"));
        let b = resolver.resolve(&ctx("canvas-hash-abcdef"));
        assert_eq!(a.fingerprint_hash, b.fingerprint_hash);
        assert_eq!(a.fingerprint_hash.unwrap().len(), 64);
    }

    #[test]
    fn test_resolve_carries_trusted_session() {
        let resolver = HintDeviceResolver::new();
        let ctx = RateLimitContext::new("192.0.2.1", "ua", Some(1)).with_trusted_session(true);
        assert!(resolver.resolve(&ctx).is_trusted_session);
    }
}
