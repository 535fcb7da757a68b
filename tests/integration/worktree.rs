//! End-to-end runs on the git worktree backend.

use std::sync::Arc;

use relay::context::GitWorktreeBackend;
use relay::orchestration::{FixedResponder, Reply, RunOutcome};

use crate::fixtures::{graph, task, Edit, Harness, TestRepo};

#[tokio::test]
async fn test_worktree_run_advances_integration_branch_only() {
    let repo = TestRepo::new();
    repo.commit_file("list.txt", "alpha\n", "Add list");
    let harness = Harness::new();
    harness
        .executor
        .edit("a", Edit::Append("list.txt".into(), "beta".into()));
    harness
        .executor
        .edit("b", Edit::Write("notes.md".into(), "# Notes\n".into()));
    harness
        .executor
        .edit("c", Edit::Append("list.txt".into(), "gamma".into()));

    let worktrees = harness.root.join("worktrees");
    let backend = GitWorktreeBackend::new(&repo.path, &worktrees, "relay/integration").unwrap();
    let rig = harness.rig_on(
        Arc::new(backend),
        &worktrees.join("contexts"),
        FixedResponder(Reply::Defer),
    );

    let report = rig
        .scheduler
        .run(graph(vec![
            task("a", 1),
            task("b", 2),
            task("c", 1).depends_on(&["a"]),
        ]))
        .await;

    assert_eq!(report.outcome, RunOutcome::Completed, "{}", report.render());
    assert_eq!(
        repo.show("relay/integration", "list.txt").as_deref(),
        Some("alpha\nbeta\ngamma\n")
    );
    assert_eq!(
        repo.show("relay/integration", "notes.md").as_deref(),
        Some("# Notes\n")
    );
    // The checked-out branch is never touched.
    assert_eq!(repo.show("HEAD", "list.txt").as_deref(), Some("alpha\n"));
    assert_eq!(repo.show("HEAD", "notes.md"), None);

    // Merged contexts give their branches back.
    assert!(repo.branches("relay/task/*").is_empty());
    assert!(rig.contexts.open_contexts().is_empty());
}

#[tokio::test]
async fn test_worktree_failed_task_keeps_its_branch_for_inspection() {
    let repo = TestRepo::new();
    let harness = Harness::new();
    harness
        .executor
        .edit("broken", Edit::Write("broken.txt".into(), "wip\n".into()));
    harness.verifier.reject("broken", 10);

    let worktrees = harness.root.join("worktrees");
    let backend = GitWorktreeBackend::new(&repo.path, &worktrees, "relay/integration").unwrap();
    let rig = harness.rig_on(
        Arc::new(backend),
        &worktrees.join("contexts"),
        FixedResponder(Reply::Defer),
    );

    let report = rig.scheduler.run(graph(vec![task("broken", 1)])).await;

    assert_eq!(report.outcome, RunOutcome::Partial);
    assert_eq!(repo.show("relay/integration", "broken.txt"), None);
    assert_eq!(repo.branches("relay/task/*").len(), 1);
}
