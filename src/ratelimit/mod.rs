//! Rate limiting logic: composite keys, policies, scoring and the engine.

pub mod decay;
pub mod engine;
pub mod keys;
pub mod ladder;
pub mod pipeline;
pub mod policy;
pub mod types;

pub use engine::{Backends, RateLimiterEngine};
pub use keys::{CompositeKeySet, KeyBuilder, KeyType};
pub use ladder::PenaltyLadder;
pub use pipeline::{EvaluationPipeline, PipelineDeps};
pub use policy::{BlockPolicy, FailureMode, PolicyKind, PolicySet};
pub use types::{
    Confidence, Decision, DeviceIdentity, OperatingMode, RateLimitContext, RateLimitRequest,
    RateLimitResult,
};
