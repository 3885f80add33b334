//! TaskStore port - タスクの正本（source of truth）
//!
//! Every method is one atomic step: a durable implementation runs each call
//! in a single transaction (or a single conditional update), the in-memory one
//! under one lock. Transitions are applied through the
//! [`TaskRecord`](crate::queue::TaskRecord) methods, which check ownership and
//! state, so no caller ever does read-then-write against the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{TaskId, WorkerId};
use crate::observability::QueueCounts;
use crate::queue::{Completion, TaskFailure, TaskRecord};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores a freshly created record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the id is already present.
    async fn insert(&self, record: TaskRecord) -> StoreResult<()>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Leases the highest-priority, oldest reservable task to `worker`.
    async fn reserve_next(
        &self,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>>;

    /// Returns false unless `worker` holds a running lease on `id`.
    async fn renew_lease(&self, id: TaskId, worker: &WorkerId, now: DateTime<Utc>)
        -> StoreResult<bool>;

    /// Returns the updated record, or `None` if `worker` does not hold `id`.
    async fn complete(
        &self,
        id: TaskId,
        worker: &WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>>;

    /// Returns the updated record, or `None` if `worker` does not hold `id`.
    async fn fail(
        &self,
        id: TaskId,
        worker: &WorkerId,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>>;

    /// Returns every running task whose lease has elapsed to `queued`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskId>>;

    /// Queued tasks whose visibility instant has passed.
    async fn count_reservable(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<QueueCounts>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> StoreResult<()>;
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend cannot be reached.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate task identifier: {0}")]
    Duplicate(TaskId),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}
