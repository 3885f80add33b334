//! Pipeline collaborators: planning, backlog and the list of active projects.
//!
//! What a plan contains and how work items are chosen for a project is outside
//! this crate; the run state machine and the scheduler only talk to these
//! traits.

use async_trait::async_trait;

use crate::domain::{CollaboratorError, PlanSummary, ProjectId, WorkItem, WorkItemId};

#[async_trait]
pub trait Planner: Send + Sync {
    /// Materializes the project's backlog. Calling it again for a project that
    /// is already planned must not duplicate work items.
    async fn plan(&self, project: &ProjectId) -> Result<PlanSummary, CollaboratorError>;
}

#[async_trait]
pub trait Backlog: Send + Sync {
    /// Oldest work item that is not done, not blocked and whose dependencies
    /// are all done.
    async fn next_eligible(&self, project: &ProjectId)
        -> Result<Option<WorkItem>, CollaboratorError>;

    async fn item(
        &self,
        project: &ProjectId,
        id: &WorkItemId,
    ) -> Result<Option<WorkItem>, CollaboratorError>;

    async fn mark_done(&self, project: &ProjectId, id: &WorkItemId)
        -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn active_projects(&self) -> Result<Vec<ProjectId>, CollaboratorError>;
}
