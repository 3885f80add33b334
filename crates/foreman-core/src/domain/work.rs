//! Work items produced by the planner and consumed by `SELECT_TASK`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkItemId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: WorkItemId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub depends_on: Vec<WorkItemId>,
}

impl WorkItem {
    pub fn new(id: impl Into<WorkItemId>, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            created_at,
            done: false,
            blocked: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depending_on(mut self, other: impl Into<WorkItemId>) -> Self {
        self.depends_on.push(other.into());
        self
    }
}

/// What a planner reports after (re)materializing a backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Items in the backlog after planning.
    pub total: usize,
    /// Items added by this call; zero when planning already happened.
    pub created: usize,
}
