//! Pluggable complexity scoring for descriptors that arrive without a score.

use crate::core::task::TaskDescriptor;
use serde::{Deserialize, Serialize};

/// Historical counters handed to a scorer. Loaded with the checkpoint at
/// session start and updated as tasks finish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreHistory {
    pub completed: u32,
    pub failed: u32,
    pub retried_attempts: u32,
}

impl ScoreHistory {
    /// Share of finished tasks that failed, 0.0 when nothing finished yet.
    pub fn failure_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0.0;
        }
        f64::from(self.failed) / f64::from(finished)
    }
}

/// Returns a 1-5 complexity for a descriptor.
///
/// Implementations may be non-deterministic across sessions; the graph
/// clamps whatever comes back.
pub trait ComplexityScorer: Send + Sync {
    fn score(&self, descriptor: &TaskDescriptor, history: &ScoreHistory) -> u8;
}

/// Scores by how much a task touches: target files and dependencies, nudged
/// upward when the run has been failing often.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetCountScorer;

impl ComplexityScorer for TargetCountScorer {
    fn score(&self, descriptor: &TaskDescriptor, history: &ScoreHistory) -> u8 {
        let targets = descriptor.file_targets.len();
        let deps = descriptor.dependencies.len();
        let mut score = 1 + targets.div_ceil(2) + deps / 3;
        if history.failure_rate() > 0.5 {
            score += 1;
        }
        score.clamp(1, 5) as u8
    }
}
