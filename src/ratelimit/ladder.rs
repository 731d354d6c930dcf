//! Penalty ladder: block level to block duration.

use serde::{Deserialize, Serialize};

/// Default block durations in seconds, index 0 is level 1.
pub const DEFAULT_LADDER_SECS: [u64; 6] = [15, 60, 300, 900, 3600, 86400];

/// Maps a block level to how long the block lasts.
///
/// Levels past the end of the ladder reuse its last rung, so the curve is
/// monotonically non-decreasing for every level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PenaltyLadder {
    rungs: Vec<u64>,
}

impl PenaltyLadder {
    /// Build a ladder from explicit rungs. Returns `None` if the rungs are
    /// empty or ever decrease.
    pub fn new(rungs: Vec<u64>) -> Option<Self> {
        if rungs.is_empty() || rungs.windows(2).any(|w| w[1] < w[0]) {
            return None;
        }
        Some(Self { rungs })
    }

    /// Block duration for `level`, in seconds. Level 0 never blocks.
    pub fn duration(&self, level: u32) -> u64 {
        if level == 0 {
            return 0;
        }
        let index = (level as usize - 1).min(self.rungs.len() - 1);
        self.rungs[index]
    }

    pub fn rungs(&self) -> &[u64] {
        &self.rungs
    }
}

impl Default for PenaltyLadder {
    fn default() -> Self {
        Self {
            rungs: DEFAULT_LADDER_SECS.to_vec(),
        }
    }
}
