//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. `TaskQueue::reserve()` で lease を取る（空なら idle backoff）
//! 2. handler を別 tokio task で実行しつつ、一定間隔で heartbeat
//! 3. 結果で `complete` / `fail` を呼ぶ（retry か dead かは queue 側が決める）
//! 4. handler の proof を ProofSink に追記
//!
//! A heartbeat answered with `false` means the lease is gone (expired and
//! reclaimed, possibly already reserved by someone else): the handler is
//! aborted and its result dropped, with no `complete`/`fail`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::{HandlerError, Outcome, ProofDraft, ProofRecord, WorkerId};
use crate::ports::{IdGenerator, ProofSink};
use crate::queue::{Completion, TaskFailure, TaskQueue, TaskRecord};

use super::runtime::Runtime;

/// Error text used when shutdown interrupts a handler.
pub const WORKER_STOPPED: &str = "worker stopped";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Lease length requested on every reservation.
    pub visibility: Duration,
    pub heartbeat_divisor: u32,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    /// How long in-flight handlers may keep running after shutdown is requested.
    pub shutdown_grace: Duration,
    pub id_prefix: String,
}

impl WorkerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility / self.heartbeat_divisor.max(1)).max(Duration::from_millis(1))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            visibility: Duration::from_secs(30),
            heartbeat_divisor: 3,
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            id_prefix: "worker".to_string(),
        }
    }
}

/// Worker pool handle.
/// - `request_shutdown()` でワーカー全体が新しい lease を取らなくなる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `settings.concurrency` workers.
    pub fn spawn(
        settings: WorkerSettings,
        queue: TaskQueue,
        runtime: Arc<Runtime>,
        proofs: Arc<dyn ProofSink>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..settings.concurrency)
            .map(|n| {
                let worker = Worker {
                    id: WorkerId::new(format!("{}-{n}", settings.id_prefix)),
                    queue: queue.clone(),
                    runtime: Arc::clone(&runtime),
                    proofs: Arc::clone(&proofs),
                    ids: Arc::clone(&ids),
                    settings: settings.clone(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    /// Stop taking new leases. In-flight handlers get the grace period.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// How a handler execution ended.
enum Execution {
    Finished(Result<Result<Outcome, HandlerError>, JoinError>),
    LeaseLost,
    Stopped,
}

struct Worker {
    id: WorkerId,
    queue: TaskQueue,
    runtime: Arc<Runtime>,
    proofs: Arc<dyn ProofSink>,
    ids: Arc<dyn IdGenerator>,
    settings: WorkerSettings,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.id, "worker started");
        let mut backoff = self.settings.idle_backoff_min;

        loop {
            // shutdown が来ていたら抜ける
            if *shutdown.borrow() {
                break;
            }

            let task = match self.queue.reserve(&self.id, self.settings.visibility).await {
                Ok(task) => task,
                Err(err) => {
                    tracing::warn!(worker = %self.id, error = %err, "reserve failed");
                    None
                }
            };

            let Some(task) = task else {
                // 空: enqueue の通知か backoff 経過まで待つ
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.queue.notified() => {
                        backoff = self.settings.idle_backoff_min;
                    }
                    _ = tokio::time::sleep(backoff) => {
                        backoff = (backoff * 2).min(self.settings.idle_backoff_max);
                    }
                }
                continue;
            };

            backoff = self.settings.idle_backoff_min;
            self.process(task, &mut shutdown).await;
        }

        tracing::info!(worker = %self.id, "worker stopped");
    }

    async fn process(&self, task: TaskRecord, shutdown: &mut watch::Receiver<bool>) {
        let envelope = task.envelope();
        tracing::debug!(
            worker = %self.id,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = envelope.attempt(),
            "executing task"
        );

        let runtime = Arc::clone(&self.runtime);
        let mut handle = tokio::spawn(async move { runtime.execute(&envelope).await });

        let every = self.settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stopping = *shutdown.borrow();
        let grace = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(grace);

        let execution = loop {
            tokio::select! {
                joined = &mut handle => break Execution::Finished(joined),
                _ = heartbeat.tick() => {
                    match self.queue.heartbeat(task.id, &self.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            handle.abort();
                            break Execution::LeaseLost;
                        }
                        // storage blip: the lease may still be valid, keep going
                        Err(err) => tracing::warn!(
                            worker = %self.id,
                            task_id = %task.id,
                            error = %err,
                            "heartbeat failed"
                        ),
                    }
                }
                _ = shutdown.changed(), if !stopping => {
                    stopping = true;
                    grace.as_mut().reset(Instant::now() + self.settings.shutdown_grace);
                    tracing::info!(
                        worker = %self.id,
                        task_id = %task.id,
                        grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                        "shutdown requested, waiting for in-flight task"
                    );
                }
                _ = &mut grace, if stopping => {
                    handle.abort();
                    break Execution::Stopped;
                }
            }
        };

        self.report(&task, execution).await;
    }

    async fn report(&self, task: &TaskRecord, execution: Execution) {
        let attempt = task.attempts + 1;
        let retry_delay = task.retry.next_delay(attempt);

        let (failure, proof) = match execution {
            Execution::LeaseLost => {
                tracing::warn!(
                    worker = %self.id,
                    task_id = %task.id,
                    "lease lost, dropping handler result"
                );
                return;
            }
            Execution::Stopped => (TaskFailure::new(WORKER_STOPPED, Duration::ZERO), None),
            Execution::Finished(Ok(Ok(outcome))) if outcome.is_success() => {
                let Outcome {
                    output,
                    proof,
                    usage,
                    ..
                } = outcome;
                match self
                    .queue
                    .complete(task.id, &self.id, Completion { output, usage })
                    .await
                {
                    // 受理された結果にだけ proof を残す
                    Ok(true) => self.record_proof(task, proof).await,
                    Ok(false) => tracing::warn!(
                        worker = %self.id,
                        task_id = %task.id,
                        "completion rejected: lease no longer held"
                    ),
                    Err(err) => tracing::error!(
                        worker = %self.id,
                        task_id = %task.id,
                        error = %err,
                        "complete failed"
                    ),
                }
                return;
            }
            Execution::Finished(Ok(Ok(outcome))) => {
                let reason = outcome
                    .reason
                    .unwrap_or_else(|| "handler reported failure".to_string());
                (TaskFailure::new(reason, retry_delay), outcome.proof)
            }
            Execution::Finished(Ok(Err(mut err))) => {
                let proof = err.take_proof();
                let mut failure = TaskFailure::new(err.to_string(), retry_delay);
                if err.is_permanent() {
                    // 1 回で終わらせる
                    failure = failure.with_max_attempts(attempt);
                }
                (failure, proof)
            }
            Execution::Finished(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task ended: {join_err}")
                };
                (TaskFailure::new(reason, retry_delay), None)
            }
        };

        tracing::info!(
            worker = %self.id,
            task_id = %task.id,
            attempt,
            error = %failure.error,
            "task attempt failed"
        );
        match self.queue.fail(task.id, &self.id, failure).await {
            Ok(true) => self.record_proof(task, proof).await,
            Ok(false) => tracing::warn!(
                worker = %self.id,
                task_id = %task.id,
                "failure report rejected: lease no longer held"
            ),
            Err(err) => tracing::error!(
                worker = %self.id,
                task_id = %task.id,
                error = %err,
                "fail report failed"
            ),
        }
    }

    async fn record_proof(&self, task: &TaskRecord, proof: Option<ProofDraft>) {
        let Some(draft) = proof else {
            return;
        };
        let record = ProofRecord::from_draft(
            self.ids.proof_id(),
            task.project_id.clone(),
            draft,
            self.queue.clock().now(),
        )
        .with_task(task.id)
        .with_meta(serde_json::json!({
            "taskType": task.task_type,
            "attempt": task.attempts + 1,
            "worker": self.id,
        }));

        // proof は失われても処理は進める
        if let Err(err) = self.proofs.append(record).await {
            tracing::warn!(task_id = %task.id, error = %err, "failed to append proof");
        }
    }
}
