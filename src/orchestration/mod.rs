//! Orchestration layer: running tasks, integrating their branches and
//! driving the whole graph round by round.

pub mod capability;
pub mod escalation;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod scheduler;

pub use capability::{
    ExecutionOutput, ExecutionRequest, Executor, ShellExecutor, ShellVerifier,
    VerificationOutcome, VerificationRequest, Verifier,
};
pub use escalation::{
    serve, Escalation, EscalationChannel, EscalationRequest, FixedResponder, FnResponder,
    PromptResponder, Reply, ResolutionChoice, ResolutionOption, Responder,
};
pub use report::{Disposition, FailureKind, FailureReport, RunOutcome, RunReport, TaskSummary};
pub use resolver::{
    AppliedChoice, BranchResult, ConflictClass, ConflictRecord, ConflictResolver, Integration,
    Resolution,
};
pub use runner::{TaskResult, TaskRunner, CANCELLED_REASON};
pub use scheduler::{select_group, CheckpointTrigger, GroupScheduler, SchedulerEvent, SessionBudget};
