//! Persistence of orchestration state across sessions.

mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointReason, CheckpointStore, ResumePointer, CHECKPOINT_VERSION,
};
