//! Conflict resolution integration tests.
//!
//! Groups whose branches touch the same file go through the resolver:
//! additive and non-semantic overlaps merge on their own, semantic ones are
//! escalated and hold back only the work that depends on them.

use std::sync::{Arc, Mutex};

use relay::core::{TaskId, TaskStatus};
use relay::orchestration::{
    ConflictClass, Escalation, FailureKind, FixedResponder, FnResponder, Reply, Resolution,
    ResolutionChoice, RunOutcome,
};

use crate::fixtures::{graph, task, Edit, Harness};

async fn run_additive(first: u8, second: u8) -> String {
    let harness = Harness::new();
    harness.write_main("list.txt", "alpha\nbeta\n");
    harness
        .executor
        .edit("p", Edit::Append("list.txt".into(), "gamma".into()));
    harness
        .executor
        .edit("q", Edit::Append("list.txt".into(), "delta".into()));
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![task("p", first), task("q", second)]))
        .await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.unresolved_conflicts.is_empty());

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(checkpoint.conflicts.len(), 1);
    assert_eq!(checkpoint.conflicts[0].classification, ConflictClass::Additive);
    assert!(matches!(
        checkpoint.conflicts[0].resolution,
        Resolution::AutoResolved { .. }
    ));

    harness.read_main("list.txt").expect("merged list")
}

#[tokio::test]
async fn test_additive_edits_commute() {
    let forward = run_additive(1, 2).await;
    let backward = run_additive(2, 1).await;

    assert_eq!(forward, backward);
    assert!(forward.starts_with("alpha\nbeta\n"));
    assert!(forward.contains("gamma\n"));
    assert!(forward.contains("delta\n"));
    assert_eq!(forward.lines().count(), 4);
}

#[tokio::test]
async fn test_disjoint_edits_merge_without_escalation() {
    let harness = Harness::new();
    harness.write_main("f.txt", "one\ntwo\nthree\nfour\nfive\n");
    harness.executor.edit(
        "head",
        Edit::Write("f.txt".into(), "ONE\ntwo\nthree\nfour\nfive\n".into()),
    );
    harness.executor.edit(
        "tail",
        Edit::Write("f.txt".into(), "one\ntwo\nthree\nfour\nFIVE\n".into()),
    );
    let escalated = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&escalated);
    let rig = harness.rig(FnResponder(move |_: &Escalation| {
        *counter.lock().unwrap() += 1;
        Reply::Defer
    }));

    let report = rig
        .scheduler
        .run(graph(vec![task("head", 1), task("tail", 2)]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(*escalated.lock().unwrap(), 0);
    assert_eq!(
        harness.read_main("f.txt").as_deref(),
        Some("ONE\ntwo\nthree\nfour\nFIVE\n")
    );
    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(
        checkpoint.conflicts[0].classification,
        ConflictClass::OverlappingNonSemantic
    );
}

fn semantic_harness() -> Harness {
    let harness = Harness::new();
    harness.write_main("config.py", "x = 1\n");
    harness
        .executor
        .edit("p", Edit::Write("config.py".into(), "x = 2\n".into()));
    harness
        .executor
        .edit("q", Edit::Write("config.py".into(), "x = 3\n".into()));
    harness
        .executor
        .edit("r", Edit::Write("r.txt".into(), "after q\n".into()));
    harness
        .executor
        .edit("s", Edit::Write("s.txt".into(), "unrelated\n".into()));
    harness
}

fn semantic_graph() -> relay::core::TaskGraph {
    graph(vec![
        task("p", 1),
        task("q", 2),
        task("s", 3),
        task("r", 1).depends_on(&["q"]),
    ])
}

#[tokio::test]
async fn test_semantic_conflict_is_escalated_and_choice_applied() {
    let harness = semantic_harness();
    let seen: Arc<Mutex<Vec<Escalation>>> = Arc::default();
    let log = Arc::clone(&seen);
    let rig = harness.rig(FnResponder(move |escalation: &Escalation| {
        log.lock().unwrap().push(escalation.clone());
        Reply::Choose(ResolutionChoice::TakeIncoming)
    }));

    let report = rig.scheduler.run(semantic_graph()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.unresolved_conflicts.is_empty());
    assert_eq!(harness.read_main("config.py").as_deref(), Some("x = 3\n"));
    assert_eq!(harness.read_main("r.txt").as_deref(), Some("after q\n"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, std::path::PathBuf::from("config.py"));
    assert_eq!(seen[0].baseline_tasks, vec![TaskId::from("p")]);
    assert_eq!(seen[0].incoming_tasks, vec![TaskId::from("q")]);
    assert_eq!(seen[0].base.as_deref(), Some("x = 1\n"));

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(
        checkpoint.conflicts[0].resolution,
        Resolution::UserResolved {
            choice: ResolutionChoice::TakeIncoming
        }
    );
    assert!(checkpoint.pending_escalations.is_empty());
}

#[tokio::test]
async fn test_deferred_conflict_holds_only_dependents() {
    let harness = semantic_harness();
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig.scheduler.run(semantic_graph()).await;

    assert_eq!(report.outcome, RunOutcome::Partial);
    assert_eq!(report.unresolved_conflicts.len(), 1);
    assert_eq!(report.unresolved_conflicts[0].classification, ConflictClass::Semantic);
    assert!(report
        .failures
        .iter()
        .any(|f| f.kind == FailureKind::ConflictEscalation));
    // Independent work finished; the dependent of the conflicting task waits.
    assert_eq!(report.status_of(&TaskId::from("s")), Some(TaskStatus::Done));
    assert_eq!(report.status_of(&TaskId::from("r")), Some(TaskStatus::Pending));
    assert!(harness.executor.attempts_of("r").is_empty());
    // The cheaper branch is the provisional baseline.
    assert_eq!(harness.read_main("config.py").as_deref(), Some("x = 2\n"));

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(checkpoint.pending_escalations.len(), 1);

    // Next session answers the re-issued escalation and finishes.
    let rig = harness.rig(FixedResponder(Reply::Choose(ResolutionChoice::KeepBaseline)));
    let report = rig.scheduler.resume(checkpoint).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.status_of(&TaskId::from("r")), Some(TaskStatus::Done));
    assert_eq!(harness.read_main("config.py").as_deref(), Some("x = 2\n"));
    assert_eq!(harness.executor.attempts_of("p"), vec![1]);
}

#[tokio::test]
async fn test_combined_choice_keeps_both_edits() {
    let harness = semantic_harness();
    let rig = harness.rig(FixedResponder(Reply::Choose(
        ResolutionChoice::BaselineThenIncoming,
    )));

    let report = rig.scheduler.run(semantic_graph()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        harness.read_main("config.py").as_deref(),
        Some("x = 2\nx = 3\n")
    );
}
