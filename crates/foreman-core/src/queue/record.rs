//! Task record: metadata + payload, and every lifecycle transition.
//!
//! Stores hold records and call these methods inside their critical section;
//! the methods themselves enforce ownership and state preconditions, so a
//! store cannot apply a transition the queue would not allow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{RetryPolicy, TaskState};
use crate::domain::{ProjectId, TaskEnvelope, TaskId, TaskType, Usage, WorkerId};
use crate::ports::clock::after;

/// Everything a caller chooses when enqueueing.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
    pub priority: i32,
    pub retry: Option<RetryPolicy>,
    /// Keep the task invisible for this long after enqueue.
    pub delay: Duration,
}

impl NewTask {
    pub fn new(project_id: ProjectId, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            project_id,
            task_type,
            payload,
            max_attempts: None,
            priority: 0,
            retry: None,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Handler result recorded on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub output: Option<serde_json::Value>,
    pub usage: Option<Usage>,
}

/// Arguments of `fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: String,
    pub retry_delay: Duration,
    /// Replaces `max_attempts` (never below the attempts already made).
    pub max_attempts_override: Option<u32>,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            error: error.into(),
            retry_delay,
            max_attempts_override: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts_override = Some(max_attempts);
        self
    }
}

/// The single source of truth for one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub priority: i32,

    /// Failed attempts so far. Lease expiry does not count.
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry: RetryPolicy,

    pub reserved_by: Option<WorkerId>,
    pub reserved_until: Option<DateTime<Utc>>,
    /// Visibility window of the current reservation, reused by heartbeats.
    pub lease: Option<Duration>,
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Not reservable before this instant.
    pub visible_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,

    pub output: Option<serde_json::Value>,
    pub usage: Option<Usage>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task: NewTask,
        default_max_attempts: u32,
        default_retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project_id: task.project_id,
            task_type: task.task_type,
            payload: task.payload,
            state: TaskState::Queued,
            priority: task.priority,
            attempts: 0,
            max_attempts: task.max_attempts.unwrap_or(default_max_attempts).max(1),
            retry: task.retry.unwrap_or_else(|| default_retry.clone()),
            reserved_by: None,
            reserved_until: None,
            lease: None,
            heartbeat_at: None,
            visible_at: after(now, task.delay),
            started_at: None,
            finished_at: None,
            error_text: None,
            output: None,
            usage: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope::new(
            self.id,
            self.project_id.clone(),
            self.task_type,
            self.payload.clone(),
            self.attempts + 1,
        )
    }

    pub fn is_reservable(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Queued && self.visible_at <= now
    }

    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.state == TaskState::Running && self.reserved_by.as_ref() == Some(worker)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Running && self.reserved_until.is_some_and(|until| until <= now)
    }

    /// queued -> running. Returns false if the task is not reservable.
    pub fn start_lease(&mut self, worker: &WorkerId, lease: Duration, now: DateTime<Utc>) -> bool {
        if !self.is_reservable(now) {
            return false;
        }
        self.state = TaskState::Running;
        self.reserved_by = Some(worker.clone());
        self.reserved_until = Some(after(now, lease));
        self.lease = Some(lease);
        self.heartbeat_at = None;
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Extends the lease by its visibility window, never shortening it.
    pub fn renew_lease(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }
        let extended = after(now, self.lease.unwrap_or_default());
        self.reserved_until = Some(match self.reserved_until {
            Some(current) => current.max(extended),
            None => extended,
        });
        self.heartbeat_at = Some(now);
        self.updated_at = now;
        true
    }

    /// running -> succeeded.
    pub fn complete(&mut self, worker: &WorkerId, completion: Completion, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }
        self.state = TaskState::Succeeded;
        self.output = completion.output;
        self.usage = completion.usage;
        self.release_lease();
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    /// running -> queued (retry) or failed (dead letter).
    pub fn fail(&mut self, worker: &WorkerId, failure: TaskFailure, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max_attempts) = failure.max_attempts_override {
            self.max_attempts = max_attempts.max(self.attempts).max(1);
        }
        self.error_text = Some(failure.error);
        self.release_lease();
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            self.state = TaskState::Queued;
            self.visible_at = after(now, failure.retry_delay);
        } else {
            self.state = TaskState::Failed;
            self.finished_at = Some(now);
        }
        true
    }

    /// running -> queued when the lease has elapsed. Attempts are untouched.
    pub fn reclaim_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if !self.lease_expired(now) {
            return false;
        }
        self.state = TaskState::Queued;
        self.release_lease();
        self.visible_at = now;
        self.updated_at = now;
        true
    }

    fn release_lease(&mut self) {
        self.reserved_by = None;
        self.reserved_until = None;
        self.lease = None;
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.id,
            project_id: self.project_id.clone(),
            task_type: self.task_type,
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error_text: self.error_text.clone(),
            reserved_by: self.reserved_by.clone(),
            reserved_until: self.reserved_until,
            visible_at: self.visible_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only view returned by `task_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_text: Option<String>,
    pub reserved_by: Option<WorkerId>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub visible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use ulid::Ulid;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[fixture]
    fn record() -> TaskRecord {
        let new_task = NewTask::new(ProjectId::new("p"), TaskType::Build, serde_json::json!({}))
            .max_attempts(2);
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            new_task,
            3,
            &RetryPolicy::default(),
            Utc::now(),
        )
    }

    #[rstest]
    fn max_attempts_is_clamped_to_one() {
        let new_task = NewTask::new(ProjectId::new("p"), TaskType::Exec, serde_json::json!(null))
            .max_attempts(0);
        let r = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            new_task,
            3,
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(r.max_attempts, 1);
    }

    #[rstest]
    fn only_the_holder_may_transition(mut record: TaskRecord) {
        let now = record.created_at;
        assert!(record.start_lease(&worker("a"), Duration::from_secs(5), now));

        assert!(!record.renew_lease(&worker("b"), now));
        assert!(!record.complete(&worker("b"), Completion::default(), now));
        assert!(!record.fail(&worker("b"), TaskFailure::new("x", Duration::ZERO), now));
        assert_eq!(record.state, TaskState::Running);
        assert_eq!(record.attempts, 0);
    }

    #[rstest]
    fn renew_never_shortens_the_lease(mut record: TaskRecord) {
        let now = record.created_at;
        record.start_lease(&worker("a"), Duration::from_secs(10), now);
        let original = record.reserved_until;

        // 期限より前に heartbeat しても短くならない
        assert!(record.renew_lease(&worker("a"), now - chrono::Duration::seconds(5)));
        assert_eq!(record.reserved_until, original);

        let later = now + chrono::Duration::seconds(8);
        assert!(record.renew_lease(&worker("a"), later));
        assert_eq!(
            record.reserved_until,
            Some(later + chrono::Duration::seconds(10))
        );
        assert_eq!(record.heartbeat_at, Some(later));
    }

    #[rstest]
    fn override_never_drops_below_attempts(mut record: TaskRecord) {
        let now = record.created_at;
        record.start_lease(&worker("a"), Duration::from_secs(5), now);
        let failure = TaskFailure::new("bad payload", Duration::ZERO).with_max_attempts(0);
        assert!(record.fail(&worker("a"), failure, now));

        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.max_attempts, 1);
    }

    #[rstest]
    fn retry_delay_hides_the_task(mut record: TaskRecord) {
        let now = record.created_at;
        record.start_lease(&worker("a"), Duration::from_secs(5), now);
        record.fail(&worker("a"), TaskFailure::new("boom", Duration::from_secs(2)), now);

        assert_eq!(record.state, TaskState::Queued);
        assert!(!record.is_reservable(now));
        assert!(record.is_reservable(now + chrono::Duration::seconds(2)));
        assert!(record.reserved_by.is_none());
    }

    #[rstest]
    fn terminal_records_are_immutable(mut record: TaskRecord) {
        let now = record.created_at;
        record.start_lease(&worker("a"), Duration::from_secs(5), now);
        record.complete(&worker("a"), Completion::default(), now);
        let snapshot = record.status();

        assert!(!record.start_lease(&worker("a"), Duration::from_secs(5), now));
        assert!(!record.reclaim_if_expired(now + chrono::Duration::hours(1)));
        assert!(!record.fail(&worker("a"), TaskFailure::new("late", Duration::ZERO), now));
        assert_eq!(record.status(), snapshot);
    }
}
