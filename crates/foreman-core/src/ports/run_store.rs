//! RunStore port - Run の永続化
//!
//! Two guarantees the run state machine depends on:
//! - at most one non-`DONE` run per project (`create_active`)
//! - optimistic concurrency: `update` only succeeds against the version the
//!   caller read, and a `DONE` run can no longer be changed

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ProjectId, Run, RunId};

pub type RunStoreResult<T> = Result<T, RunStoreError>;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores `run` as the project's active run.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::ActiveRunExists`] when the project already has
    /// a non-`DONE` run.
    async fn create_active(&self, run: Run) -> RunStoreResult<Run>;

    async fn get(&self, id: RunId) -> RunStoreResult<Option<Run>>;

    async fn find_active(&self, project: &ProjectId) -> RunStoreResult<Option<Run>>;

    /// Most recently created run of the project, active or not.
    async fn latest(&self, project: &ProjectId) -> RunStoreResult<Option<Run>>;

    /// Replaces the stored run and returns it with its version bumped.
    ///
    /// # Errors
    ///
    /// - [`RunStoreError::NotFound`] for an unknown id
    /// - [`RunStoreError::VersionConflict`] when `run.version` is stale
    /// - [`RunStoreError::Finalized`] when the stored run is already `DONE`
    async fn update(&self, run: &Run) -> RunStoreResult<Run>;

    async fn list_active(&self) -> RunStoreResult<Vec<Run>>;
}

#[derive(Debug, Clone, Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("project {project} already has active run {run_id}")]
    ActiveRunExists { project: ProjectId, run_id: RunId },

    #[error("run {run_id} version conflict: expected {expected}, stored {actual}")]
    VersionConflict {
        run_id: RunId,
        expected: u64,
        actual: u64,
    },

    #[error("run {0} is finalized")]
    Finalized(RunId),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl RunStoreError {
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}
