use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{ProjectId, TaskId};

/// Closed set of handler kinds a task can be dispatched to.
///
/// Unknown kinds are rejected when a request is parsed, so a worker never sees
/// a task it has no variant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Exec,
    Codegen,
    Build,
    Test,
    Deploy,
    Screenshot,
    Analyze,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Exec,
        TaskType::Codegen,
        TaskType::Build,
        TaskType::Test,
        TaskType::Deploy,
        TaskType::Screenshot,
        TaskType::Analyze,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Exec => "exec",
            TaskType::Codegen => "codegen",
            TaskType::Build => "build",
            TaskType::Test => "test",
            TaskType::Deploy => "deploy",
            TaskType::Screenshot => "screenshot",
            TaskType::Analyze => "analyze",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// What a handler gets to see of a reserved task.
///
/// Owned copy of the record's immutable parts, so the handler can run on its
/// own tokio task without holding anything from the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    project_id: ProjectId,
    task_type: TaskType,
    payload: serde_json::Value,
    /// 1-based number of the attempt being executed.
    attempt: u32,
}

impl TaskEnvelope {
    pub fn new(
        task_id: TaskId,
        project_id: ProjectId,
        task_type: TaskType,
        payload: serde_json::Value,
        attempt: u32,
    ) -> Self {
        Self {
            task_id,
            project_id,
            task_type,
            payload,
            attempt,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
