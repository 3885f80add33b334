//! Queue module: task lifecycle, retry policy, and the in-memory store.
//!
//! [`TaskQueue`] is the handle everything else talks to. It is cheap to
//! clone; every clone shares one [`TaskStore`], one clock and one wake-up
//! signal for idle workers.
//!
//! Design intent:
//! - The store applies state transitions (queued -> running -> ...) atomically.
//! - Workers execute side effects and report the result through `complete`
//!   or `fail`, always naming themselves so ownership is checked.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryTaskStore;
pub use record::{Completion, NewTask, TaskFailure, TaskRecord, TaskStatus};
pub use retry::RetryPolicy;
pub use state::TaskState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::domain::{TaskId, WorkerId};
use crate::observability::QueueCounts;
use crate::ports::{Clock, IdGenerator, StoreResult, SystemClock, TaskStore, UlidGenerator};

/// Applied to tasks enqueued without their own settings.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub max_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    notify: Arc<Notify>,
    defaults: QueueDefaults,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        defaults: QueueDefaults,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            notify: Arc::new(Notify::new()),
            defaults,
        }
    }

    /// In-memory store, system clock, default policy.
    pub fn in_memory() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::clone(&clock),
            Arc::new(UlidGenerator::new(clock)),
            QueueDefaults::default(),
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// Creates a `queued` task with `attempts = 0`.
    pub async fn enqueue(&self, task: NewTask) -> StoreResult<TaskId> {
        let now = self.clock.now();
        let delayed = !task.delay.is_zero();
        let record = TaskRecord::new(
            self.ids.task_id(),
            task,
            self.defaults.max_attempts,
            &self.defaults.retry,
            now,
        );
        let task_id = record.id;
        let (project, task_type) = (record.project_id.clone(), record.task_type);

        self.store.insert(record).await?;
        tracing::debug!(%task_id, %project, %task_type, "task enqueued");

        if !delayed {
            self.notify.notify_one();
        }
        Ok(task_id)
    }

    /// Leases the next task to `worker` for `visibility`.
    pub async fn reserve(
        &self,
        worker: &WorkerId,
        visibility: Duration,
    ) -> StoreResult<Option<TaskRecord>> {
        let leased = self
            .store
            .reserve_next(worker, visibility, self.clock.now())
            .await?;
        if let Some(task) = &leased {
            tracing::debug!(task_id = %task.id, %worker, attempts = task.attempts, "task reserved");
        }
        Ok(leased)
    }

    /// Renews `worker`'s lease. False means the lease is gone.
    pub async fn heartbeat(&self, task_id: TaskId, worker: &WorkerId) -> StoreResult<bool> {
        self.store
            .renew_lease(task_id, worker, self.clock.now())
            .await
    }

    pub async fn ack(&self, task_id: TaskId, worker: &WorkerId) -> StoreResult<bool> {
        self.complete(task_id, worker, Completion::default()).await
    }

    /// `ack` that also records the handler's output and usage.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        completion: Completion,
    ) -> StoreResult<bool> {
        let updated = self
            .store
            .complete(task_id, worker, completion, self.clock.now())
            .await?;
        match &updated {
            Some(_) => tracing::debug!(%task_id, %worker, "task succeeded"),
            None => tracing::debug!(%task_id, %worker, "ack ignored: lease not held"),
        }
        Ok(updated.is_some())
    }

    pub async fn fail(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        failure: TaskFailure,
    ) -> StoreResult<bool> {
        let retry_now = failure.retry_delay.is_zero();
        let Some(record) = self
            .store
            .fail(task_id, worker, failure, self.clock.now())
            .await?
        else {
            tracing::debug!(%task_id, %worker, "fail ignored: lease not held");
            return Ok(false);
        };

        match record.state {
            TaskState::Failed => tracing::warn!(
                %task_id,
                attempts = record.attempts,
                max_attempts = record.max_attempts,
                error = record.error_text.as_deref().unwrap_or_default(),
                "task dead-lettered"
            ),
            _ => {
                tracing::info!(
                    %task_id,
                    attempts = record.attempts,
                    max_attempts = record.max_attempts,
                    visible_at = %record.visible_at,
                    "task scheduled for retry"
                );
                if retry_now {
                    self.notify.notify_one();
                }
            }
        }
        Ok(true)
    }

    /// Queued tasks a worker could reserve right now.
    pub async fn depth(&self) -> StoreResult<usize> {
        self.store.count_reservable(self.clock.now()).await
    }

    /// Returns expired leases to `queued`. Returns how many were reclaimed.
    pub async fn sweep_expired_leases(&self) -> StoreResult<usize> {
        let reclaimed = self.store.reclaim_expired(self.clock.now()).await?;
        if !reclaimed.is_empty() {
            tracing::warn!(count = reclaimed.len(), tasks = ?reclaimed, "reclaimed expired leases");
            self.notify.notify_waiters();
        }
        Ok(reclaimed.len())
    }

    pub async fn get(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.store.get(task_id).await
    }

    pub async fn status(&self, task_id: TaskId) -> StoreResult<Option<TaskStatus>> {
        Ok(self.store.get(task_id).await?.map(|record| record.status()))
    }

    pub async fn counts(&self) -> StoreResult<QueueCounts> {
        self.store.counts(self.clock.now()).await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.store.ping().await
    }

    /// Resolves the next time work may have become available.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
