//! RunStateMachine - project ごとの Run を 1 tick ずつ進める
//!
//! Each tick does at most one step for one run: plan, pick a work item,
//! enqueue a stage task, or look at the stage task it is already waiting on.
//! Everything the step learned is written back through [`RunStore::update`]
//! before the tick returns, so a crashed process resumes from the store.
//!
//! Ticks and reviews of the same run are serialized by a per-run lock; the
//! store's version check catches writers in other processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::Instrument;

use crate::domain::{
    CollaboratorError, DoneReason, ProjectId, ProofBody, ProofDraft, ProofRecord, ReviewAction,
    Run, RunBudget, RunId, RunState, RunTransitionError, TaskId,
};
use crate::observability::run_span;
use crate::ports::{
    Backlog, Clock, IdGenerator, Planner, ProofSink, RunStore, RunStoreError, StoreError,
};
use crate::queue::{NewTask, TaskQueue, TaskState};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub stage_max_attempts: u32,
    pub stage_priority: i32,
    /// Cap on `Run::last_actions`.
    pub action_log_limit: usize,
    pub budget_tokens: Option<u64>,
    pub budget_usd: Option<f64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            stage_max_attempts: 3,
            stage_priority: 0,
            action_log_limit: 50,
            budget_tokens: None,
            budget_usd: None,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced { from: RunState, to: RunState },
    StageEnqueued { state: RunState, task_id: TaskId },
    /// The stage task is still queued or running.
    Waiting { state: RunState, task_id: TaskId },
    StageFailed { state: RunState, failures: u32 },
    AwaitingReview,
    /// Budget exhausted; no new stage work is enqueued.
    Parked { state: RunState },
    /// `DONE`; nothing left to do.
    Idle,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run {run_id} is in {state}, reviews are only accepted in REVIEW")]
    NotInReview { run_id: RunId, state: RunState },

    #[error(transparent)]
    Store(#[from] RunStoreError),

    #[error(transparent)]
    Queue(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] RunTransitionError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

pub struct RunStateMachine {
    runs: Arc<dyn RunStore>,
    queue: TaskQueue,
    planner: Arc<dyn Planner>,
    backlog: Arc<dyn Backlog>,
    proofs: Arc<dyn ProofSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    settings: RunSettings,
    locks: RunLocks,
}

type RunLocks = Arc<StdMutex<HashMap<RunId, Arc<Mutex<()>>>>>;

/// Holds one run's lock. On drop the map entry goes away unless another
/// caller is already waiting on it.
struct RunLockGuard {
    locks: RunLocks,
    run_id: RunId,
    lock: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // map と自分だけが持っていれば待ち手はいない
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.run_id);
        }
    }
}

impl RunStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<dyn RunStore>,
        queue: TaskQueue,
        planner: Arc<dyn Planner>,
        backlog: Arc<dyn Backlog>,
        proofs: Arc<dyn ProofSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        settings: RunSettings,
    ) -> Self {
        Self {
            runs,
            queue,
            planner,
            backlog,
            proofs,
            ids,
            clock,
            settings,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub async fn get(&self, run_id: RunId) -> Result<Run, RunError> {
        self.runs.get(run_id).await?.ok_or(RunError::NotFound(run_id))
    }

    /// Returns the project's active run, creating one in `PLAN` if there is
    /// none. Concurrent callers end up with the same run.
    pub async fn start(&self, project: &ProjectId) -> Result<Run, RunError> {
        if let Some(run) = self.runs.find_active(project).await? {
            return Ok(run);
        }

        let run = Run::new(
            self.ids.run_id(),
            project.clone(),
            RunBudget::new(self.settings.budget_tokens, self.settings.budget_usd),
            self.clock.now(),
        );
        match self.runs.create_active(run).await {
            Ok(run) => {
                tracing::info!(run_id = %run.id, %project, "run started");
                Ok(run)
            }
            Err(err @ RunStoreError::ActiveRunExists { .. }) => {
                // 競合した相手の run に合流する
                self.runs.find_active(project).await?.ok_or(RunError::Store(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Like [`start`](Self::start), but a project whose last run found no
    /// eligible work only gets a new run once its backlog has some.
    pub async fn ensure_active(&self, project: &ProjectId) -> Result<Option<Run>, RunError> {
        if let Some(run) = self.runs.find_active(project).await? {
            return Ok(Some(run));
        }
        if let Some(last) = self.runs.latest(project).await?
            && last.done_reason == Some(DoneReason::NoEligibleWork)
            && self.backlog.next_eligible(project).await?.is_none()
        {
            return Ok(None);
        }
        self.start(project).await.map(Some)
    }

    #[tracing::instrument(
        skip(self),
        fields(project = tracing::field::Empty, state = tracing::field::Empty)
    )]
    pub async fn tick(&self, run_id: RunId) -> Result<TickOutcome, RunError> {
        let _held = self.lock_run(run_id).await;

        let mut run = self.get(run_id).await?;
        let span = tracing::Span::current();
        span.record("project", tracing::field::display(&run.project_id));
        span.record("state", run.state.as_str());

        let outcome = match run.state {
            RunState::Done => TickOutcome::Idle,
            RunState::Review => TickOutcome::AwaitingReview,
            RunState::Plan => match self.planner.plan(&run.project_id).await {
                Ok(summary) => {
                    let note = format!(
                        "planned {} work items ({} new)",
                        summary.total, summary.created
                    );
                    self.advance(&mut run, RunState::SelectTask, note).await?
                }
                Err(err) => self.collaborator_failed(&mut run, err).await?,
            },
            RunState::SelectTask => match self.backlog.next_eligible(&run.project_id).await {
                Ok(None) => {
                    run.done_reason = Some(DoneReason::NoEligibleWork);
                    self.advance(&mut run, RunState::Done, "no eligible work").await?
                }
                Ok(Some(item)) => {
                    let note = format!("selected {}: {}", item.id, item.title);
                    run.current_task_id = Some(item.id);
                    self.advance(&mut run, RunState::Codegen, note).await?
                }
                Err(err) => self.collaborator_failed(&mut run, err).await?,
            },
            state => self.drive_stage(&mut run, state).await?,
        };

        tracing::debug!(?outcome, "tick finished");
        Ok(outcome)
    }

    /// Applies a human decision to a run in `REVIEW`. Any other state is
    /// rejected and the run is left untouched.
    pub async fn review(&self, run_id: RunId, action: ReviewAction) -> Result<Run, RunError> {
        let _held = self.lock_run(run_id).await;

        let mut run = self.get(run_id).await?;
        let span = run_span("review", run.id, &run.project_id);
        async move {
            if run.state != RunState::Review {
                tracing::warn!(state = %run.state, %action, "review rejected");
                return Err(RunError::NotInReview {
                    run_id,
                    state: run.state,
                });
            }

            let target = match action {
                ReviewAction::Approve => RunState::Teardown,
                ReviewAction::Redo => {
                    run.current_task_id = None;
                    RunState::SelectTask
                }
            };
            self.advance(&mut run, target, format!("review: {action}"))
                .await?;

            let draft = ProofDraft::new(
                "review",
                format!("Review {action}"),
                ProofBody::Content(format!("{action} -> {target}")),
            );
            self.record_proof(&run, draft, None).await;
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn drive_stage(&self, run: &mut Run, state: RunState) -> Result<TickOutcome, RunError> {
        let Some(task_type) = state.stage_task_type() else {
            return Ok(TickOutcome::Idle);
        };

        let Some(task_id) = run.stage_task_id else {
            // TEARDOWN は予算切れでも片付けのために実行する
            if state != RunState::Teardown && run.budget.is_exhausted() {
                tracing::warn!(
                    spent_tokens = run.budget.spent_tokens,
                    spent_usd = run.budget.spent_usd,
                    "budget exhausted, run parked"
                );
                return Ok(TickOutcome::Parked { state });
            }

            let payload = match self.stage_payload(run, state).await {
                Ok(payload) => payload,
                Err(err) => return self.collaborator_failed(run, err).await,
            };
            let task = NewTask::new(run.project_id.clone(), task_type, payload)
                .max_attempts(self.settings.stage_max_attempts)
                .priority(self.settings.stage_priority);
            let task_id = self.queue.enqueue(task).await?;
            run.stage_task_id = Some(task_id);
            run.updated_at = self.clock.now();
            self.save(run).await?;
            tracing::info!(%task_id, %task_type, "stage task enqueued");
            return Ok(TickOutcome::StageEnqueued { state, task_id });
        };

        let Some(task) = self.queue.get(task_id).await? else {
            return self
                .stage_failed(run, state, Some(task_id), "stage task disappeared from the queue")
                .await;
        };

        match task.state {
            TaskState::Queued | TaskState::Running => Ok(TickOutcome::Waiting { state, task_id }),
            TaskState::Failed => {
                let reason = task.error_text.unwrap_or_else(|| "stage task failed".to_string());
                self.stage_failed(run, state, Some(task_id), &reason).await
            }
            TaskState::Succeeded => {
                if let Some(usage) = task.usage {
                    run.budget.charge(usage);
                }
                if state == RunState::Teardown {
                    if let Some(item) = run.current_task_id.clone()
                        && let Err(err) = self.backlog.mark_done(&run.project_id, &item).await
                    {
                        // TEARDOWN をやり直して mark_done を再試行する
                        let reason = format!("failed to mark {item} done: {err}");
                        return self.stage_failed(run, state, Some(task_id), &reason).await;
                    }
                    run.done_reason = Some(DoneReason::Completed);
                }
                let Some(next) = state.next_on_success() else {
                    return Ok(TickOutcome::Idle);
                };
                self.advance(run, next, format!("{task_type} task {task_id} succeeded"))
                    .await
            }
        }
    }

    async fn stage_payload(
        &self,
        run: &Run,
        state: RunState,
    ) -> Result<serde_json::Value, CollaboratorError> {
        let item = match &run.current_task_id {
            Some(id) => self.backlog.item(&run.project_id, id).await?,
            None => None,
        };
        Ok(json!({
            "runId": run.id,
            "projectId": run.project_id,
            "stage": state,
            "workItem": item,
            "teardown": state == RunState::Teardown,
        }))
    }

    /// A planner or backlog error counts as a failure of the current stage.
    async fn collaborator_failed(
        &self,
        run: &mut Run,
        err: CollaboratorError,
    ) -> Result<TickOutcome, RunError> {
        let state = run.state;
        self.stage_failed(run, state, None, &err.to_string()).await
    }

    async fn stage_failed(
        &self,
        run: &mut Run,
        state: RunState,
        task_id: Option<TaskId>,
        reason: &str,
    ) -> Result<TickOutcome, RunError> {
        run.record_stage_failure(self.clock.now());
        self.save(run).await?;
        tracing::warn!(?task_id, failures = run.stage_failures, reason, "stage failed");

        let draft = ProofDraft::new(
            "stage_failure",
            format!("{state} failed"),
            ProofBody::Content(reason.to_string()),
        );
        self.record_proof(run, draft, task_id).await;
        Ok(TickOutcome::StageFailed {
            state,
            failures: run.stage_failures,
        })
    }

    async fn advance(
        &self,
        run: &mut Run,
        target: RunState,
        note: impl Into<String>,
    ) -> Result<TickOutcome, RunError> {
        let from = run.state;
        let stage_task = run.stage_task_id;
        let note = note.into();
        run.transition_to(target, note.clone(), self.clock.now(), self.settings.action_log_limit)?;
        self.save(run).await?;
        tracing::info!(run_id = %run.id, %from, to = %target, "run transitioned");

        let draft = ProofDraft::new(
            "transition",
            format!("{from} -> {target}"),
            ProofBody::Content(note),
        );
        self.record_proof(run, draft, stage_task).await;
        Ok(TickOutcome::Advanced { from, to: target })
    }

    async fn save(&self, run: &mut Run) -> Result<(), RunError> {
        *run = self.runs.update(run).await?;
        Ok(())
    }

    /// 証跡の失敗で run を止めない
    async fn record_proof(&self, run: &Run, draft: ProofDraft, task_id: Option<TaskId>) {
        let mut record = ProofRecord::from_draft(
            self.ids.proof_id(),
            run.project_id.clone(),
            draft,
            self.clock.now(),
        )
        .with_run(run.id)
        .with_meta(json!({ "state": run.state, "version": run.version }));
        if let Some(task_id) = task_id {
            record = record.with_task(task_id);
        }
        if let Err(err) = self.proofs.append(record).await {
            tracing::warn!(run_id = %run.id, error = %err, "failed to record run proof");
        }
    }

    async fn lock_run(&self, run_id: RunId) -> RunLockGuard {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(run_id).or_default())
        };
        let mut guard = RunLockGuard {
            locks: Arc::clone(&self.locks),
            run_id,
            lock: Arc::clone(&lock),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::status::{HealthCause, HealthProbe, HealthSettings, LoopMonitor};
    use crate::domain::{PlanSummary, TaskType, Usage, WorkItem, WorkItemId, WorkerId};
    use crate::impls::{InMemoryBacklog, InMemoryProofSink, InMemoryRunStore};
    use crate::ports::{ManualClock, UlidGenerator};
    use crate::queue::{Completion, InMemoryTaskStore, QueueDefaults, TaskFailure};
    use async_trait::async_trait;
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Harness {
        machine: Arc<RunStateMachine>,
        queue: TaskQueue,
        backlog: Arc<InMemoryBacklog>,
        runs: Arc<InMemoryRunStore>,
        proofs: Arc<InMemoryProofSink>,
        clock: ManualClock,
    }

    fn harness_with(settings: RunSettings) -> Harness {
        let backlog = Arc::new(InMemoryBacklog::new());
        harness_wired(settings, backlog.clone(), backlog.clone(), backlog)
    }

    fn harness_wired(
        settings: RunSettings,
        planner: Arc<dyn Planner>,
        backlog_port: Arc<dyn Backlog>,
        backlog: Arc<InMemoryBacklog>,
    ) -> Harness {
        let clock = ManualClock::default();
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let queue = TaskQueue::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(clock.clone()),
            Arc::clone(&ids),
            QueueDefaults::default(),
        );
        let proofs = Arc::new(InMemoryProofSink::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let machine = Arc::new(RunStateMachine::new(
            runs.clone(),
            queue.clone(),
            planner,
            backlog_port,
            proofs.clone(),
            ids,
            Arc::new(clock.clone()),
            settings,
        ));
        Harness {
            machine,
            queue,
            backlog,
            runs,
            proofs,
            clock,
        }
    }

    struct OfflinePlanner;

    #[async_trait]
    impl Planner for OfflinePlanner {
        async fn plan(&self, _project: &ProjectId) -> Result<PlanSummary, CollaboratorError> {
            Err(CollaboratorError::transient("planner offline"))
        }
    }

    /// Backlog whose `mark_done` fails while `failing` is set.
    struct StickyBacklog {
        inner: Arc<InMemoryBacklog>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Backlog for StickyBacklog {
        async fn next_eligible(
            &self,
            project: &ProjectId,
        ) -> Result<Option<WorkItem>, CollaboratorError> {
            self.inner.next_eligible(project).await
        }

        async fn item(
            &self,
            project: &ProjectId,
            id: &WorkItemId,
        ) -> Result<Option<WorkItem>, CollaboratorError> {
            self.inner.item(project, id).await
        }

        async fn mark_done(
            &self,
            project: &ProjectId,
            id: &WorkItemId,
        ) -> Result<(), CollaboratorError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError::transient("backlog read-only"));
            }
            self.inner.mark_done(project, id).await
        }
    }

    #[fixture]
    fn harness() -> Harness {
        harness_with(RunSettings::default())
    }

    fn project() -> ProjectId {
        ProjectId::new("acme")
    }

    async fn seed_one_item(h: &Harness) {
        h.backlog
            .seed_plan(
                project(),
                vec![WorkItem::new("login", "Add login page", h.clock.now())],
            )
            .await;
    }

    /// Plays the worker for the stage task the run is waiting on.
    async fn finish_stage(h: &Harness, expected: TaskType, usage: Usage) {
        let worker = WorkerId::new("test-worker");
        let task = h
            .queue
            .reserve(&worker, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("stage task should be queued");
        assert_eq!(task.task_type, expected);
        let completion = Completion {
            output: None,
            usage: Some(usage),
        };
        assert!(h.queue.complete(task.id, &worker, completion).await.unwrap());
    }

    async fn tick_to_review(h: &Harness, run_id: RunId) {
        for (state, task_type) in [
            (RunState::Codegen, TaskType::Codegen),
            (RunState::Build, TaskType::Build),
            (RunState::DeployPreview, TaskType::Deploy),
            (RunState::Eval, TaskType::Analyze),
        ] {
            assert!(matches!(
                h.machine.tick(run_id).await.unwrap(),
                TickOutcome::StageEnqueued { state: s, .. } if s == state
            ));
            finish_stage(h, task_type, Usage::new(10, 0.01)).await;
            let next = state.next_on_success().unwrap();
            assert_eq!(
                h.machine.tick(run_id).await.unwrap(),
                TickOutcome::Advanced { from: state, to: next }
            );
        }
    }

    #[rstest]
    #[tokio::test]
    async fn empty_backlog_goes_straight_to_done(harness: Harness) {
        harness.backlog.seed_plan(project(), Vec::new()).await;
        let run = harness.machine.start(&project()).await.unwrap();

        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::Advanced {
                from: RunState::Plan,
                to: RunState::SelectTask
            }
        );
        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::Advanced {
                from: RunState::SelectTask,
                to: RunState::Done
            }
        );

        let done = harness.machine.get(run.id).await.unwrap();
        for _ in 0..3 {
            assert_eq!(harness.machine.tick(run.id).await.unwrap(), TickOutcome::Idle);
        }
        let after = harness.machine.get(run.id).await.unwrap();
        assert_eq!(after, done);
        assert_eq!(after.done_reason, Some(DoneReason::NoEligibleWork));
        assert_eq!(harness.queue.counts().await.unwrap().total(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn happy_path_runs_every_stage(harness: Harness) {
        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();

        harness.machine.tick(run.id).await.unwrap(); // PLAN
        harness.machine.tick(run.id).await.unwrap(); // SELECT_TASK
        let selected = harness.machine.get(run.id).await.unwrap();
        assert_eq!(selected.state, RunState::Codegen);
        assert_eq!(selected.current_task_id.as_ref().map(|id| id.as_str()), Some("login"));

        tick_to_review(&harness, run.id).await;
        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::AwaitingReview
        );

        let reviewed = harness
            .machine
            .review(run.id, ReviewAction::Approve)
            .await
            .unwrap();
        assert_eq!(reviewed.state, RunState::Teardown);

        harness.machine.tick(run.id).await.unwrap();
        finish_stage(&harness, TaskType::Deploy, Usage::default()).await;
        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::Advanced {
                from: RunState::Teardown,
                to: RunState::Done
            }
        );

        let done = harness.machine.get(run.id).await.unwrap();
        assert_eq!(done.done_reason, Some(DoneReason::Completed));
        assert_eq!(done.budget.spent_tokens, 40);
        assert!(harness.backlog.items(&project()).await[0].done);

        let path: Vec<_> = done.last_actions.iter().map(|a| a.to).collect();
        assert_eq!(
            path,
            vec![
                RunState::SelectTask,
                RunState::Codegen,
                RunState::Build,
                RunState::DeployPreview,
                RunState::Eval,
                RunState::Review,
                RunState::Teardown,
                RunState::Done,
            ]
        );

        let proofs = harness.proofs.for_run(run.id).await;
        assert_eq!(proofs.iter().filter(|p| p.kind == "transition").count(), 8);
        assert_eq!(proofs.iter().filter(|p| p.kind == "review").count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn stage_payload_describes_the_work_item(harness: Harness) {
        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();

        let TickOutcome::StageEnqueued { task_id, .. } = harness.machine.tick(run.id).await.unwrap()
        else {
            panic!("expected a stage task");
        };
        let task = harness.queue.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.payload["stage"], "CODEGEN");
        assert_eq!(task.payload["workItem"]["title"], "Add login page");
        assert_eq!(task.payload["teardown"], false);
        assert_eq!(task.max_attempts, 3);

        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::Waiting {
                state: RunState::Codegen,
                task_id
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn redo_returns_to_select_task(harness: Harness) {
        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();
        tick_to_review(&harness, run.id).await;

        let redone = harness
            .machine
            .review(run.id, ReviewAction::Redo)
            .await
            .unwrap();
        assert_eq!(redone.state, RunState::SelectTask);
        assert!(redone.current_task_id.is_none());

        // the item is not done yet, so it is picked again
        harness.machine.tick(run.id).await.unwrap();
        assert_eq!(
            harness.machine.get(run.id).await.unwrap().state,
            RunState::Codegen
        );
    }

    #[rstest]
    #[case(ReviewAction::Approve)]
    #[case(ReviewAction::Redo)]
    #[tokio::test]
    async fn review_outside_review_state_is_rejected(
        harness: Harness,
        #[case] action: ReviewAction,
    ) {
        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();
        let before = harness.machine.get(run.id).await.unwrap();

        let err = harness.machine.review(run.id, action).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::NotInReview {
                state: RunState::Plan,
                ..
            }
        ));
        assert_eq!(harness.machine.get(run.id).await.unwrap(), before);
        assert!(harness.proofs.records().await.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_stage_is_retried_on_the_next_tick(harness: Harness) {
        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();

        let TickOutcome::StageEnqueued { task_id, .. } = harness.machine.tick(run.id).await.unwrap()
        else {
            panic!("expected a stage task");
        };
        let worker = WorkerId::new("w");
        harness.queue.reserve(&worker, Duration::from_secs(5)).await.unwrap();
        harness
            .queue
            .fail(
                task_id,
                &worker,
                TaskFailure::new("model refused", Duration::ZERO).with_max_attempts(1),
            )
            .await
            .unwrap();

        assert_eq!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::StageFailed {
                state: RunState::Codegen,
                failures: 1
            }
        );
        let parked = harness.machine.get(run.id).await.unwrap();
        assert_eq!(parked.state, RunState::Codegen);
        assert!(parked.stage_task_id.is_none());

        let failures: Vec<_> = harness
            .proofs
            .for_run(run.id)
            .await
            .into_iter()
            .filter(|p| p.kind == "stage_failure")
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, Some(task_id));
        assert_eq!(failures[0].body, ProofBody::Content("model refused".into()));

        assert!(matches!(
            harness.machine.tick(run.id).await.unwrap(),
            TickOutcome::StageEnqueued {
                state: RunState::Codegen,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exhausted_budget_parks_work_stages() {
        let h = harness_with(RunSettings {
            budget_tokens: Some(15),
            ..RunSettings::default()
        });
        seed_one_item(&h).await;
        let run = h.machine.start(&project()).await.unwrap();
        h.machine.tick(run.id).await.unwrap();
        h.machine.tick(run.id).await.unwrap();

        h.machine.tick(run.id).await.unwrap();
        finish_stage(&h, TaskType::Codegen, Usage::new(20, 0.0)).await;
        h.machine.tick(run.id).await.unwrap();

        assert_eq!(
            h.machine.tick(run.id).await.unwrap(),
            TickOutcome::Parked {
                state: RunState::Build
            }
        );
        assert_eq!(h.queue.counts().await.unwrap().total(), 1);
        assert!(h.machine.get(run.id).await.unwrap().budget.is_exhausted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_converge_on_one_run() {
        let h = harness_with(RunSettings::default());
        seed_one_item(&h).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let machine = Arc::clone(&h.machine);
            handles.push(tokio::spawn(async move {
                machine.start(&project()).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn ensure_active_waits_for_new_work_after_an_empty_run(harness: Harness) {
        harness.backlog.seed_plan(project(), Vec::new()).await;
        let first = harness.machine.ensure_active(&project()).await.unwrap().unwrap();
        harness.machine.tick(first.id).await.unwrap();
        harness.machine.tick(first.id).await.unwrap();

        assert!(harness.machine.ensure_active(&project()).await.unwrap().is_none());

        harness
            .backlog
            .push_item(&project(), WorkItem::new("late", "Late item", harness.clock.now()))
            .await;
        let second = harness.machine.ensure_active(&project()).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.state, RunState::Plan);
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_run_is_not_found(harness: Harness) {
        let missing = RunId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            harness.machine.tick(missing).await,
            Err(RunError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn planner_failures_are_stage_failures_visible_in_health() {
        let backlog = Arc::new(InMemoryBacklog::new());
        let h = harness_wired(
            RunSettings::default(),
            Arc::new(OfflinePlanner),
            backlog.clone(),
            backlog,
        );
        let run = h.machine.start(&project()).await.unwrap();

        for n in 1..=4 {
            assert_eq!(
                h.machine.tick(run.id).await.unwrap(),
                TickOutcome::StageFailed {
                    state: RunState::Plan,
                    failures: n
                }
            );
        }

        let failures: Vec<_> = h
            .proofs
            .for_run(run.id)
            .await
            .into_iter()
            .filter(|p| p.kind == "stage_failure")
            .collect();
        assert_eq!(failures.len(), 4);
        assert!(failures.iter().all(|p| p.task_id.is_none()));

        let probe = HealthProbe::new(
            h.queue.clone(),
            h.runs.clone(),
            LoopMonitor::new(),
            LoopMonitor::new(),
            Arc::new(h.clock.clone()),
            HealthSettings::default(),
        );
        let report = probe.check().await;
        assert!(report.causes.contains(&HealthCause::StageStuck {
            run_id: run.id,
            project_id: project(),
            state: RunState::Plan,
            failures: 4,
        }));
    }

    #[tokio::test]
    async fn failed_mark_done_repeats_teardown() {
        let backlog = Arc::new(InMemoryBacklog::new());
        let sticky = Arc::new(StickyBacklog {
            inner: backlog.clone(),
            failing: AtomicBool::new(true),
        });
        let h = harness_wired(RunSettings::default(), backlog.clone(), sticky.clone(), backlog);
        seed_one_item(&h).await;
        let run = h.machine.start(&project()).await.unwrap();
        h.machine.tick(run.id).await.unwrap();
        h.machine.tick(run.id).await.unwrap();
        tick_to_review(&h, run.id).await;
        h.machine.review(run.id, ReviewAction::Approve).await.unwrap();

        h.machine.tick(run.id).await.unwrap();
        finish_stage(&h, TaskType::Deploy, Usage::default()).await;
        assert_eq!(
            h.machine.tick(run.id).await.unwrap(),
            TickOutcome::StageFailed {
                state: RunState::Teardown,
                failures: 1
            }
        );
        let stuck = h.machine.get(run.id).await.unwrap();
        assert_eq!(stuck.state, RunState::Teardown);
        assert!(stuck.stage_task_id.is_none());
        assert!(!h.backlog.items(&project()).await[0].done);

        sticky.failing.store(false, Ordering::SeqCst);
        assert!(matches!(
            h.machine.tick(run.id).await.unwrap(),
            TickOutcome::StageEnqueued {
                state: RunState::Teardown,
                ..
            }
        ));
        finish_stage(&h, TaskType::Deploy, Usage::default()).await;
        assert_eq!(
            h.machine.tick(run.id).await.unwrap(),
            TickOutcome::Advanced {
                from: RunState::Teardown,
                to: RunState::Done
            }
        );
        assert!(h.backlog.items(&project()).await[0].done);
    }

    #[rstest]
    #[tokio::test]
    async fn run_locks_are_released_after_each_call(harness: Harness) {
        for _ in 0..1000 {
            let missing = RunId::from_ulid(ulid::Ulid::new());
            assert!(harness.machine.tick(missing).await.is_err());
            assert!(harness
                .machine
                .review(missing, ReviewAction::Approve)
                .await
                .is_err());
        }
        assert_eq!(harness.machine.lock_entries(), 0);

        seed_one_item(&harness).await;
        let run = harness.machine.start(&project()).await.unwrap();
        harness.machine.tick(run.id).await.unwrap();
        assert!(harness.machine.review(run.id, ReviewAction::Redo).await.is_err());
        assert_eq!(harness.machine.lock_entries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ticks_share_one_lock_and_release_it() {
        let h = harness_with(RunSettings::default());
        seed_one_item(&h).await;
        let run = h.machine.start(&project()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let machine = Arc::clone(&h.machine);
            handles.push(tokio::spawn(async move { machine.tick(run.id).await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // PLAN, SELECT_TASK, one CODEGEN enqueue, then waiting
        let after = h.machine.get(run.id).await.unwrap();
        assert_eq!(after.state, RunState::Codegen);
        assert_eq!(h.queue.counts().await.unwrap().total(), 1);
        assert_eq!(h.machine.lock_entries(), 0);
    }
}
