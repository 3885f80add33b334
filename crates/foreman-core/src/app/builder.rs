//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - グローバル状態なし: queue も store もここで作って注入する

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ForemanConfig};
use crate::domain::{ProjectId, ReviewAction, Run, RunId, TaskId, TaskType};
use crate::error::ForemanError;
use crate::impls::{InMemoryBacklog, InMemoryProofSink, InMemoryRunStore};
use crate::ports::{
    Backlog, Clock, IdGenerator, Planner, ProjectDirectory, ProofSink, RunStore, SystemClock,
    TaskStore, UlidGenerator,
};
use crate::queue::{InMemoryTaskStore, NewTask, TaskQueue, TaskStatus};
use crate::typed::{Handler, Payload};

use super::reaper_loop::ReaperLoop;
use super::run_machine::{RunStateMachine, TickOutcome};
use super::runtime::{HandlerRegistry, RegistryError, Runtime, TaskHandler};
use super::scheduler::Scheduler;
use super::status::{HealthProbe, HealthReport, LoopMonitor};
use super::worker_loop::WorkerPool;

/// Planner, backlog and project directory, usually one object.
#[derive(Clone)]
struct Pipeline {
    planner: Arc<dyn Planner>,
    backlog: Arc<dyn Backlog>,
    projects: Arc<dyn ProjectDirectory>,
}

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .with_config(config)
///     .register::<BuildPayload, _>(BuildHandler)?
///     .expect_tasks(&[TaskType::Build])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される TaskType を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 設定も build() で検証する
///
/// 差し替えなかった部品（clock, store, proof sink, pipeline）は in-memory 実装になる。
pub struct AppBuilder {
    config: ForemanConfig,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<TaskType>>,
    clock: Option<Arc<dyn Clock>>,
    task_store: Option<Arc<dyn TaskStore>>,
    run_store: Option<Arc<dyn RunStore>>,
    proofs: Option<Arc<dyn ProofSink>>,
    pipeline: Option<Pipeline>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<TaskType>),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: ForemanConfig::default(),
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            clock: None,
            task_store: None,
            run_store: None,
            proofs: None,
            pipeline: None,
        }
    }

    pub fn with_config(mut self, config: ForemanConfig) -> Self {
        self.config = config;
        self
    }

    /// Typed handler を登録
    pub fn register<T: Payload, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Envelope をそのまま受け取る handler を登録
    pub fn register_handler(
        mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[TaskType]) -> Self {
        self.expected_tasks = Some(task_types.to_vec());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn with_proof_sink(mut self, proofs: Arc<dyn ProofSink>) -> Self {
        self.proofs = Some(proofs);
        self
    }

    pub fn with_pipeline<P>(mut self, pipeline: Arc<P>) -> Self
    where
        P: Planner + Backlog + ProjectDirectory + 'static,
    {
        self.pipeline = Some(Pipeline {
            planner: pipeline.clone(),
            backlog: pipeline.clone(),
            projects: pipeline,
        });
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - 設定値（`ForemanConfig::validate`）
    /// - expect_tasks() で設定された TaskType が全て登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let mut missing_tasks: Vec<TaskType> = expected_tasks
                .iter()
                .copied()
                .filter(|task_type| !self.registry.contains(*task_type))
                .collect();
            missing_tasks.sort();
            missing_tasks.dedup();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let task_store = self
            .task_store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let runs = self
            .run_store
            .unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));
        let proofs = self
            .proofs
            .unwrap_or_else(|| Arc::new(InMemoryProofSink::new()));
        let pipeline = self.pipeline.unwrap_or_else(|| {
            let backlog = Arc::new(InMemoryBacklog::new());
            Pipeline {
                planner: backlog.clone(),
                backlog: backlog.clone(),
                projects: backlog,
            }
        });

        let queue = TaskQueue::new(
            task_store,
            Arc::clone(&clock),
            Arc::clone(&ids),
            self.config.queue.defaults(),
        );
        let machine = Arc::new(RunStateMachine::new(
            Arc::clone(&runs),
            queue.clone(),
            pipeline.planner,
            pipeline.backlog,
            Arc::clone(&proofs),
            Arc::clone(&ids),
            Arc::clone(&clock),
            self.config.runs.settings(),
        ));
        let monitor = LoopMonitor::new();
        let sweeper = LoopMonitor::new();
        let health = HealthProbe::new(
            queue.clone(),
            runs,
            monitor.clone(),
            sweeper.clone(),
            Arc::clone(&clock),
            self.config.health.settings(),
        );

        tracing::info!(
            handlers = ?self.registry.registered_types(),
            workers = self.config.workers.concurrency,
            "app built"
        );

        Ok(App {
            config: self.config,
            queue,
            runtime: Arc::new(Runtime::new(Arc::new(self.registry))),
            machine,
            projects: pipeline.projects,
            proofs,
            ids,
            clock,
            monitor,
            sweeper,
            health,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue request as it arrives from outside (e.g. an HTTP body).
///
/// `type` is parsed into the closed [`TaskType`] set, so an unknown type
/// fails here instead of reaching a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnqueueRequest {
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay_ms: u64,
}

impl EnqueueRequest {
    pub fn new(project_id: ProjectId, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            project_id,
            task_type,
            payload,
            max_attempts: None,
            priority: 0,
            delay_ms: 0,
        }
    }

    fn into_task(self) -> NewTask {
        let mut task = NewTask::new(self.project_id, self.task_type, self.payload)
            .priority(self.priority)
            .delay(Duration::from_millis(self.delay_ms));
        if let Some(max_attempts) = self.max_attempts {
            task = task.max_attempts(max_attempts);
        }
        task
    }
}

/// App はアプリケーションのランタイム
///
/// 外部インターフェース（enqueue / status / run 操作 / health）の窓口。
/// `spawn()` で worker pool, scheduler, reaper を起動する。
pub struct App {
    config: ForemanConfig,
    queue: TaskQueue,
    runtime: Arc<Runtime>,
    machine: Arc<RunStateMachine>,
    projects: Arc<dyn ProjectDirectory>,
    proofs: Arc<dyn ProofSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    monitor: LoopMonitor,
    sweeper: LoopMonitor,
    health: HealthProbe,
}

impl App {
    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.runtime.registry().registered_types()
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, ForemanError> {
        Ok(self.queue.enqueue(request.into_task()).await?)
    }

    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus, ForemanError> {
        self.queue
            .status(task_id)
            .await?
            .ok_or(ForemanError::TaskNotFound(task_id))
    }

    pub async fn start_run(&self, project: &ProjectId) -> Result<Run, ForemanError> {
        Ok(self.machine.start(project).await?)
    }

    pub async fn tick_run(&self, run_id: RunId) -> Result<TickOutcome, ForemanError> {
        Ok(self.machine.tick(run_id).await?)
    }

    pub async fn review_run(
        &self,
        run_id: RunId,
        action: ReviewAction,
    ) -> Result<Run, ForemanError> {
        Ok(self.machine.review(run_id, action).await?)
    }

    pub async fn run(&self, run_id: RunId) -> Result<Run, ForemanError> {
        Ok(self.machine.get(run_id).await?)
    }

    pub async fn health(&self) -> HealthReport {
        self.health.check().await
    }

    /// Starts the worker pool, the scheduler and the reaper.
    pub fn spawn(&self) -> RunningApp {
        let workers = WorkerPool::spawn(
            self.config.workers.settings(),
            self.queue.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.proofs),
            Arc::clone(&self.ids),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            Arc::clone(&self.machine),
            Arc::clone(&self.projects),
            Arc::clone(&self.clock),
            self.monitor.clone(),
            self.config.scheduler.tick_interval(),
        );
        let reaper = ReaperLoop::new(
            self.queue.clone(),
            self.sweeper.clone(),
            self.config.scheduler.sweep_interval(),
        );

        let loops = vec![
            tokio::spawn(scheduler.run(shutdown_rx.clone())),
            tokio::spawn(reaper.run(shutdown_rx)),
        ];
        tracing::info!(workers = workers.size(), "app started");

        RunningApp {
            workers,
            shutdown_tx,
            loops,
        }
    }
}

/// Handle to the background parts started by [`App::spawn`].
pub struct RunningApp {
    workers: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl RunningApp {
    /// Stops the loops first so no new stage work is enqueued, then drains
    /// the workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.loops {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background loop ended abnormally");
            }
        }
        self.workers.shutdown_and_join().await;
        tracing::info!("app stopped");
    }
}
