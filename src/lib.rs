//! Adaptive Ratelimit - Composite Abuse Mitigation Engine
//!
//! This crate scores requests under several composite keys at once (network,
//! IP+UA, device, account, account+device), decays those scores over time,
//! correlates fingerprint and IP behavior, and escalates through a penalty
//! ladder of soft and hard blocks. A circuit breaker tracks store health and
//! switches evaluations to a local fallback when the store misbehaves.

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod resilience;
pub mod store;
