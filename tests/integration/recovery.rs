//! Checkpoint and recovery integration tests.
//!
//! These tests verify that every finished group is persisted, that a
//! restore never trusts in-flight work and that a damaged checkpoint falls
//! back to the last good one.

use relay::core::{EvidenceEntry, TaskId, TaskStatus};
use relay::orchestration::{FixedResponder, Reply, RunOutcome};
use relay::state::{Checkpoint, CheckpointReason, ResumePointer};

use crate::fixtures::{graph, task, Edit, Harness};

#[tokio::test]
async fn test_checkpoint_after_every_group() {
    let harness = Harness::new();
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("a", 1),
            task("b", 1).depends_on(&["a"]),
            task("c", 1).depends_on(&["b"]),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    // One per group plus the final one.
    assert_eq!(harness.checkpoint_files(), 4);

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::Final);
    assert_eq!(checkpoint.resume.round, 3);
    assert!(checkpoint
        .tasks
        .iter()
        .all(|node| node.status == TaskStatus::Done));
    assert_eq!(checkpoint.history.completed, 3);
    assert_eq!(
        report.checkpoint.as_deref(),
        Some(harness.store().path_of(checkpoint.seq).as_path())
    );
}

#[tokio::test]
async fn test_restore_resets_in_flight_and_resume_reruns_it() {
    let harness = Harness::new();
    harness
        .executor
        .edit("a", Edit::Write("a.txt".into(), "fresh\n".into()));
    let a = TaskId::from("a");
    let crashed = graph(vec![task("a", 1), task("b", 1).depends_on(&["a"])])
        .apply(&a, TaskStatus::Ready, None)
        .and_then(|g| {
            g.apply(
                &a,
                TaskStatus::Running,
                Some(EvidenceEntry::note("running before the crash")),
            )
        })
        .unwrap();
    harness
        .store()
        .write_sync(Checkpoint::capture(
            &crashed,
            ResumePointer::default(),
            CheckpointReason::GroupComplete,
        ))
        .unwrap();

    let restored = harness.store().restore().await.unwrap().unwrap();
    let node = restored.tasks.iter().find(|n| n.id == a).unwrap();
    assert_eq!(node.status, TaskStatus::Pending);

    let rig = harness.rig(FixedResponder(Reply::Defer));
    let report = rig.scheduler.resume(restored).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(harness.executor.attempts_of("a"), vec![1]);
    assert_eq!(harness.read_main("a.txt").as_deref(), Some("fresh\n"));
}

#[tokio::test]
async fn test_resume_of_finished_run_does_nothing() {
    let harness = Harness::new();
    let rig = harness.rig(FixedResponder(Reply::Defer));
    rig.scheduler.run(graph(vec![task("a", 1)])).await;
    let before = harness.executor.started().len();

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    let rig = harness.rig(FixedResponder(Reply::Defer));
    let report = rig.scheduler.resume(checkpoint).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.rounds, 1);
    assert_eq!(harness.executor.started().len(), before);
}

#[tokio::test]
async fn test_explicit_retry_keeps_dependent_of_other_failure_blocked() {
    let harness = Harness::new();
    harness.verifier.reject("a", 3);
    harness.executor.fail_first("b", u32::MAX);
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("a", 1),
            task("b", 1),
            task("c", 1).depends_on(&["a", "b"]),
        ]))
        .await;
    assert_eq!(report.outcome, RunOutcome::Partial);
    assert_eq!(report.status_of(&TaskId::from("a")), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(&TaskId::from("b")), Some(TaskStatus::Failed));

    let store = harness.store();
    let mut checkpoint = store.restore().await.unwrap().unwrap();
    let mut task_graph = checkpoint.graph().unwrap();
    let reopened = task_graph
        .retry(&TaskId::from("a"), harness.config.runner.explicit_retries)
        .unwrap();
    // `b` still failed, so `c` stays where it is.
    assert!(reopened.is_empty());
    checkpoint.tasks = task_graph.to_nodes();
    store.write_sync(checkpoint).unwrap();

    let checkpoint = store.restore().await.unwrap().unwrap();
    let rig = harness.rig(FixedResponder(Reply::Defer));
    let report = rig.scheduler.resume(checkpoint).await;

    assert_eq!(report.outcome, RunOutcome::Partial, "{}", report.render());
    assert_eq!(report.status_of(&TaskId::from("a")), Some(TaskStatus::Done));
    assert_eq!(report.status_of(&TaskId::from("b")), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(&TaskId::from("c")), Some(TaskStatus::Blocked));
    assert!(harness.executor.attempts_of("c").is_empty());
}

#[tokio::test]
async fn test_damaged_current_checkpoint_falls_back() {
    let harness = Harness::new();
    let rig = harness.rig(FixedResponder(Reply::Defer));
    rig.scheduler
        .run(graph(vec![task("a", 1), task("b", 1).depends_on(&["a"])]))
        .await;
    let good = harness.store().restore().await.unwrap().unwrap();

    // A torn write: newer file with garbage, pointer already switched.
    let dir = harness.store().dir().to_path_buf();
    std::fs::write(dir.join("checkpoint-000099.json"), "{\"version\": 1, \"seq\"").unwrap();
    std::fs::write(dir.join("CURRENT"), "checkpoint-000099.json\n").unwrap();
    std::fs::write(dir.join("checkpoint-000100.json.tmp"), "partial").unwrap();

    let restored = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(restored.seq, good.seq);
    assert_eq!(restored.tasks, good.tasks);
}

#[tokio::test]
async fn test_requested_checkpoint_is_taken_at_round_boundary() {
    let harness = Harness::new();
    let rig = harness.rig(FixedResponder(Reply::Defer));
    rig.scheduler.checkpoint_trigger().request();

    rig.scheduler.run(graph(vec![task("a", 1)])).await;

    let store = harness.store();
    let first = std::fs::read_to_string(store.path_of(1)).unwrap();
    let first: Checkpoint = serde_json::from_str(&first).unwrap();
    assert_eq!(first.reason, CheckpointReason::Requested);
    assert_eq!(first.resume.next_group, vec![TaskId::from("a")]);
}
