//! Task state machine for the queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - queued -> running -> succeeded
/// - queued -> running -> queued (fail with attempts left, or lease expired)
/// - queued -> running -> failed (attempts exhausted: dead letter)
///
/// Using an enum ensures exhaustive matching and prevents invalid states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker; may be invisible until its retry delay elapses.
    Queued,

    /// Leased by exactly one worker.
    Running,

    /// Successfully completed.
    Succeeded,

    /// Exhausted its attempts.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
