//! In-memory task store.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Completion, TaskFailure, TaskRecord, TaskState};
use crate::domain::{TaskId, WorkerId};
use crate::observability::QueueCounts;
use crate::ports::{StoreError, StoreResult, TaskStore};

/// Ordering key of the ready index: priority desc, then created_at, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<i32>,
    created_at: DateTime<Utc>,
    task_id: TaskId,
}

impl ReadyKey {
    fn of(record: &TaskRecord) -> Self {
        Self {
            priority: Reverse(record.priority),
            created_at: record.created_at,
            task_id: record.id,
        }
    }
}

/// Scheduled task entry (retry backoff / delayed enqueue).
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    visible_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Default)]
struct StoreState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Queued and visible.
    ready: BTreeSet<ReadyKey>,

    /// Queued but not yet visible.
    scheduled: BinaryHeap<ScheduledTask>,

    running: HashSet<TaskId>,
}

impl StoreState {
    /// Move tasks from scheduled to ready if their time has come.
    fn promote_scheduled(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.visible_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get(&entry.task_id)
                && record.is_reservable(now)
            {
                self.ready.insert(ReadyKey::of(record));
            }
        }
    }

    /// Put a queued record into the ready index or the scheduled heap.
    fn index_queued(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        let Some(record) = self.records.get(&task_id) else {
            return;
        };
        if record.state != TaskState::Queued {
            return;
        }
        if record.visible_at <= now {
            self.ready.insert(ReadyKey::of(record));
        } else {
            self.scheduled.push(ScheduledTask {
                visible_at: record.visible_at,
                task_id,
            });
        }
    }

    /// Re-index `task_id` after a transition away from `running`.
    fn after_release(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        self.running.remove(&task_id);
        self.index_queued(task_id, now);
    }
}

/// In-memory [`TaskStore`].
///
/// One `tokio::sync::Mutex` guards all records and indexes, which makes every
/// trait method a single critical section.
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the backend. While unavailable every
    /// call returns [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        let task_id = record.id;
        let created_at = record.created_at;
        state.records.insert(task_id, record);
        state.index_queued(task_id, created_at);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn reserve_next(
        &self,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.promote_scheduled(now);

        while let Some(key) = state.ready.pop_first() {
            let Some(record) = state.records.get_mut(&key.task_id) else {
                continue;
            };
            // stale index entry (should not happen, but never lease twice)
            if !record.start_lease(worker, lease, now) {
                continue;
            }
            let leased = record.clone();
            state.running.insert(key.task_id);
            return Ok(Some(leased));
        }
        Ok(None)
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .records
            .get_mut(&id)
            .is_some_and(|record| record.renew_lease(worker, now)))
    }

    async fn complete(
        &self,
        id: TaskId,
        worker: &WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        if !record.complete(worker, completion, now) {
            return Ok(None);
        }
        let updated = record.clone();
        state.after_release(id, now);
        Ok(Some(updated))
    }

    async fn fail(
        &self,
        id: TaskId,
        worker: &WorkerId,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        if !record.fail(worker, failure, now) {
            return Ok(None);
        }
        let updated = record.clone();
        state.after_release(id, now);
        Ok(Some(updated))
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskId>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let StoreState {
            records, running, ..
        } = &mut *state;

        let mut reclaimed: Vec<TaskId> = running
            .iter()
            .copied()
            .filter(|id| {
                records
                    .get_mut(id)
                    .is_some_and(|record| record.reclaim_if_expired(now))
            })
            .collect();
        reclaimed.sort();

        for id in &reclaimed {
            state.after_release(*id, now);
        }
        Ok(reclaimed)
    }

    async fn count_reservable(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.promote_scheduled(now);
        Ok(state.ready.len())
    }

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<QueueCounts> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            match record.state {
                TaskState::Queued if record.visible_at <= now => counts.queued += 1,
                TaskState::Queued => counts.delayed += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
