//! Proof records: append-only evidence of what a stage or task attempted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, ProofId, RunId, TaskId};

/// Either inline content or a pointer to where the evidence lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofBody {
    Content(String),
    Uri(String),
}

/// Proof as produced by a handler or a stage, before it is attributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofDraft {
    /// Free-form category, e.g. `screenshot`, `build_log`, `stage_failure`.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub body: ProofBody,
}

impl ProofDraft {
    pub fn new(kind: impl Into<String>, title: impl Into<String>, body: ProofBody) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            description: String::new(),
            body,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A proof as stored by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRecord {
    pub id: ProofId,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    pub body: ProofBody,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl ProofRecord {
    pub fn from_draft(
        id: ProofId,
        project_id: ProjectId,
        draft: ProofDraft,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project_id,
            run_id: None,
            task_id: None,
            kind: draft.kind,
            title: draft.title,
            description: draft.description,
            body: draft.body,
            meta: serde_json::Value::Null,
            recorded_at,
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}
