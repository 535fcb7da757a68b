//! Group scheduling tests: ordering, parallelism, retries, cancellation,
//! stalls and session handoff.

use std::time::Duration;

use relay::core::{TaskStatus, TaskId};
use relay::orchestration::{
    FailureKind, FixedResponder, Reply, RunOutcome, SchedulerEvent, CANCELLED_REASON,
};
use relay::state::{Checkpoint, CheckpointReason, ResumePointer};

use crate::fixtures::{graph, ids, task, Edit, Harness};

#[tokio::test]
async fn test_linear_chain_runs_one_task_per_round() {
    let harness = Harness::new();
    for id in ["a", "b", "c"] {
        harness
            .executor
            .edit(id, Edit::Append("log.txt".into(), id.into()));
    }
    let mut rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("a", 1),
            task("b", 1).depends_on(&["a"]),
            task("c", 1).depends_on(&["b"]),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.rounds, 3);
    assert!(report.failures.is_empty());
    assert_eq!(harness.read_main("log.txt").as_deref(), Some("a\nb\nc\n"));
    assert_eq!(
        rig.groups(),
        vec![ids(&["a"]), ids(&["b"]), ids(&["c"])]
    );
    assert!(rig.contexts.open_contexts().is_empty());
}

#[tokio::test]
async fn test_fan_out_runs_as_one_parallel_group() {
    let mut harness = Harness::new();
    harness.config.scheduler.max_parallelism = 4;
    harness.executor = crate::fixtures::ScriptedExecutor::new(Duration::from_millis(200));
    for id in ["root", "x", "y", "z", "join"] {
        harness
            .executor
            .edit(id, Edit::Write(format!("{}.txt", id), format!("{}\n", id)));
    }
    let mut rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("root", 1),
            task("x", 1).depends_on(&["root"]),
            task("y", 1).depends_on(&["root"]),
            task("z", 1).depends_on(&["root"]),
            task("join", 1).depends_on(&["x", "y", "z"]),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        rig.groups(),
        vec![ids(&["root"]), ids(&["x", "y", "z"]), ids(&["join"])]
    );
    assert!(harness.executor.peak() >= 2, "group members should overlap");
    for id in ["root", "x", "y", "z", "join"] {
        assert_eq!(
            harness.read_main(&format!("{}.txt", id)),
            Some(format!("{}\n", id))
        );
    }
}

#[tokio::test]
async fn test_parallelism_bound_takes_cheapest_first() {
    let mut harness = Harness::new();
    harness.config.scheduler.max_parallelism = 2;
    harness.executor = crate::fixtures::ScriptedExecutor::new(Duration::from_millis(50));
    let mut rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("e", 5),
            task("a", 1),
            task("c", 3),
            task("b", 2),
            task("d", 4),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        rig.groups(),
        vec![ids(&["a", "b"]), ids(&["c", "d"]), ids(&["e"])]
    );
    assert!(harness.executor.peak() <= 2);
}

#[tokio::test]
async fn test_sequential_threshold_shares_one_context() {
    let mut harness = Harness::new();
    harness.config.scheduler.sequential_threshold = 2;
    harness
        .executor
        .edit("a", Edit::Append("shared.txt".into(), "a".into()));
    harness
        .executor
        .edit("b", Edit::Append("shared.txt".into(), "b".into()));
    let mut rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![task("a", 1), task("b", 1)]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let branches: Vec<String> = rig
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskStarted { branch, .. } => Some(branch),
            _ => None,
        })
        .collect();
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[0], branches[1]);
    // The second task saw the first one's work.
    assert_eq!(harness.read_main("shared.txt").as_deref(), Some("a\nb\n"));
}

#[tokio::test]
async fn test_retry_succeeds_within_bound() {
    let harness = Harness::new();
    harness.executor.fail_first("flaky", 1);
    harness
        .executor
        .edit("flaky", Edit::Write("out.txt".into(), "ok\n".into()));
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig.scheduler.run(graph(vec![task("flaky", 1)])).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(harness.executor.attempts_of("flaky"), vec![1, 2]);
    assert_eq!(report.tasks[0].attempts, 2);
    assert_eq!(harness.read_main("out.txt").as_deref(), Some("ok\n"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_task_and_block_dependents() {
    let harness = Harness::new();
    harness
        .executor
        .edit("flaky", Edit::Write("flaky.txt".into(), "half done\n".into()));
    harness.verifier.reject("flaky", 3);
    harness
        .executor
        .edit("sibling", Edit::Write("sibling.txt".into(), "done\n".into()));
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![
            task("flaky", 1),
            task("sibling", 1),
            task("after", 1).depends_on(&["flaky"]),
            task("later", 1).depends_on(&["after"]),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Partial);
    assert_eq!(harness.executor.attempts_of("flaky"), vec![1, 2, 3]);
    assert_eq!(report.status_of(&TaskId::from("flaky")), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(&TaskId::from("sibling")), Some(TaskStatus::Done));
    assert_eq!(report.status_of(&TaskId::from("after")), Some(TaskStatus::Blocked));
    assert_eq!(report.status_of(&TaskId::from("later")), Some(TaskStatus::Blocked));
    assert!(harness.executor.attempts_of("after").is_empty());

    let flaky = report
        .failures
        .iter()
        .find(|f| f.task.as_ref() == Some(&TaskId::from("flaky")))
        .expect("failure for flaky");
    assert_eq!(flaky.kind, FailureKind::VerificationFailed);
    assert!(report
        .failures
        .iter()
        .any(|f| f.task.as_ref() == Some(&TaskId::from("later"))
            && f.kind == FailureKind::UpstreamFailed));

    // Rejected work never reaches the main line.
    assert_eq!(harness.read_main("flaky.txt"), None);
    assert_eq!(harness.read_main("sibling.txt").as_deref(), Some("done\n"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_cancellation_blocks_open_tasks_and_resume_finishes() {
    let harness = Harness::new();
    harness.executor.hang("slow", Duration::from_secs(60));
    harness
        .executor
        .edit("slow", Edit::Write("slow.txt".into(), "slow\n".into()));
    let mut rig = harness.rig(FixedResponder(Reply::Defer));
    let cancel = rig.scheduler.cancel_token();

    let scheduler = rig.scheduler;
    let run = tokio::spawn(async move {
        scheduler
            .run(graph(vec![
                task("slow", 1),
                task("next", 1).depends_on(&["slow"]),
            ]))
            .await
    });
    loop {
        match rig.events.recv().await {
            Some(SchedulerEvent::TaskStarted { .. }) => break,
            Some(_) => continue,
            None => panic!("scheduler ended before starting a task"),
        }
    }
    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation should be prompt")
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.exit_code(), 130);
    for summary in &report.tasks {
        assert_eq!(summary.status, TaskStatus::Blocked);
        assert_eq!(summary.blocked_reason.as_deref(), Some(CANCELLED_REASON));
    }
    assert!(rig.contexts.open_contexts().is_empty());

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::Cancelled);

    // A new session re-opens the cancelled tasks.
    harness.executor.hang("slow", Duration::ZERO);
    let rig = harness.rig(FixedResponder(Reply::Defer));
    let report = rig.scheduler.resume(checkpoint).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(harness.read_main("slow.txt").as_deref(), Some("slow\n"));
}

#[tokio::test]
async fn test_unsatisfiable_dependency_is_reported_as_stall() {
    let harness = Harness::new();
    let mut held = graph(vec![task("vendor", 1), task("app", 1).depends_on(&["vendor"])]);
    assert!(held.block(&TaskId::from("vendor"), "waiting on vendor drop"));
    let checkpoint = Checkpoint::capture(
        &held,
        ResumePointer::default(),
        CheckpointReason::Requested,
    );
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig.scheduler.resume(checkpoint).await;

    assert_eq!(report.outcome, RunOutcome::Stalled);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.status_of(&TaskId::from("app")), Some(TaskStatus::Blocked));
    let stalled = report
        .failures
        .iter()
        .find(|f| f.kind == FailureKind::Stalled)
        .expect("stall failure");
    assert_eq!(stalled.task, Some(TaskId::from("app")));
    assert!(stalled.message.contains("vendor"));
    assert!(harness.executor.started().is_empty());
}

#[tokio::test]
async fn test_session_budget_hands_off_between_groups() {
    let mut harness = Harness::new();
    harness.config.budget.session_limit_secs = Some(0);
    for id in ["a", "b"] {
        harness
            .executor
            .edit(id, Edit::Append("log.txt".into(), id.into()));
    }
    let rig = harness.rig(FixedResponder(Reply::Defer));

    let report = rig
        .scheduler
        .run(graph(vec![task("a", 1), task("b", 1).depends_on(&["a"])]))
        .await;

    assert_eq!(report.outcome, RunOutcome::HandedOff);
    assert_eq!(report.rounds, 1);
    let pointer = report.resume_pointer.clone().expect("resume pointer");
    assert_eq!(pointer.round, 1);
    assert_eq!(pointer.next_group, ids(&["b"]));

    let checkpoint = harness.store().restore().await.unwrap().unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::Budget);

    // Every session makes at least one round of progress.
    let rig = harness.rig(FixedResponder(Reply::Defer));
    let report = rig.scheduler.resume(checkpoint).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.rounds, 2);
    assert_eq!(harness.read_main("log.txt").as_deref(), Some("a\nb\n"));
}
