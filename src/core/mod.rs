//! Core domain models: task nodes and the task graph.

pub mod dag;
pub mod scoring;
pub mod shared;
pub mod task;

pub use dag::TaskGraph;
pub use scoring::{ComplexityScorer, ScoreHistory, TargetCountScorer};
pub use shared::SharedGraph;
pub use task::{
    AttemptOutcome, AttemptRecord, Evidence, EvidenceEntry, TaskDescriptor, TaskId, TaskNode,
    TaskStatus, VerificationDirective,
};
