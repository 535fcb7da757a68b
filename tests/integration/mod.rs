//! Integration test suite for relay.
//!
//! These tests drive the group scheduler end to end with scripted
//! executors and verifiers over real workspaces.
//!
//! # Test Categories
//!
//! - `scheduling`: round ordering, parallelism, retries, cancellation
//! - `conflict_resolution`: merging a group's branches and escalation
//! - `recovery`: checkpoints and resume
//! - `worktree`: the git worktree backend
//!
//! # CI Compatibility
//!
//! Nothing here runs external tools other than `git`.

mod fixtures;

mod conflict_resolution;
mod recovery;
mod scheduling;
mod worktree;
