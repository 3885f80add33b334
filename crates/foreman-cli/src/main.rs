use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use foreman_core::app::TaskHandler;
use foreman_core::domain::{
    HandlerError, Outcome, ProjectId, ProofBody, ProofDraft, ReviewAction, RunState, TaskEnvelope,
    TaskType, Usage, WorkItem,
};
use foreman_core::impls::InMemoryBacklog;
use foreman_core::observability::{LogFormat, init_logging};
use foreman_core::queue::TaskState;
use foreman_core::typed::{Handler, Payload};
use foreman_core::{App, AppBuilder, EnqueueRequest, ForemanConfig};

#[derive(Debug, Parser)]
#[command(name = "foreman", version, about = "Lease-based task queue and run pipeline")]
struct Cli {
    /// JSON config file. Defaults apply when omitted.
    #[arg(long, global = true, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `workers.concurrency`.
    #[arg(long, global = true, env = "FOREMAN_WORKERS")]
    workers: Option<usize>,

    #[arg(long, global = true, env = "FOREMAN_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one project through the pipeline and a flaky task through retries.
    Demo,
    /// Start workers, scheduler and reaper until Ctrl-C.
    Serve,
    /// Validate the config and print the effective values.
    CheckConfig,
}

impl Cli {
    fn load_config(&self) -> Result<ForemanConfig> {
        let mut config = match &self.config {
            Some(path) => ForemanConfig::from_path(path)?,
            None => ForemanConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers.concurrency = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GreetPayload {
    name: String,
}

impl Payload for GreetPayload {
    const TYPE: TaskType = TaskType::Exec;
}

/// Fails the first `n` calls, then greets.
struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<GreetPayload> for GreetHandler {
    async fn handle(
        &self,
        payload: GreetPayload,
        envelope: &TaskEnvelope,
    ) -> Result<Outcome, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::transient(format!(
                "intentional failure (left={left})"
            )));
        }

        let greeting = format!("Hello, {}! (attempt {})", payload.name, envelope.attempt());
        Ok(Outcome::success()
            .with_output(serde_json::json!({ "greeting": greeting }))
            .with_proof(ProofDraft::new(
                "greeting",
                "Greeting sent",
                ProofBody::Content(greeting),
            )))
    }
}

/// Stand-in for codegen / build / deploy / analyze: records what it was
/// asked to do and charges a fixed usage.
struct StageEcho;

#[async_trait]
impl TaskHandler for StageEcho {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Outcome, HandlerError> {
        let payload = envelope.payload();
        let stage = payload["stage"].as_str().unwrap_or("?");
        let item = payload["workItem"]["title"].as_str().unwrap_or("-");
        sleep(Duration::from_millis(50)).await;

        Ok(Outcome::success()
            .with_output(serde_json::json!({ "stage": stage }))
            .with_usage(Usage::new(120, 0.002))
            .with_proof(ProofDraft::new(
                format!("{}_log", envelope.task_type()),
                format!("{stage} for {item}"),
                ProofBody::Content(format!("{stage} ok")),
            )))
    }
}

fn build_app(config: ForemanConfig, backlog: Arc<InMemoryBacklog>) -> Result<App> {
    let mut builder = AppBuilder::new()
        .with_config(config)
        .with_pipeline(backlog)
        .register::<GreetPayload, _>(GreetHandler::new(2))?;
    for task_type in [
        TaskType::Codegen,
        TaskType::Build,
        TaskType::Deploy,
        TaskType::Analyze,
    ] {
        builder = builder.register_handler(task_type, Arc::new(StageEcho))?;
    }
    let app = builder
        .expect_tasks(&[
            TaskType::Exec,
            TaskType::Codegen,
            TaskType::Build,
            TaskType::Deploy,
            TaskType::Analyze,
        ])
        .build()?;
    Ok(app)
}

async fn seed_demo_project(backlog: &InMemoryBacklog) -> ProjectId {
    let project = ProjectId::new("demo-shop");
    let now = chrono::Utc::now();
    backlog
        .seed_plan(
            project.clone(),
            vec![
                WorkItem::new("landing", "Landing page", now)
                    .with_description("Hero section and signup form"),
                WorkItem::new("checkout", "Checkout flow", now + chrono::Duration::seconds(1))
                    .depending_on("landing"),
            ],
        )
        .await;
    project
}

async fn demo(config: ForemanConfig) -> Result<()> {
    let backlog = Arc::new(InMemoryBacklog::new());
    let project = seed_demo_project(&backlog).await;
    let app = build_app(config, Arc::clone(&backlog))?;
    let running = app.spawn();

    // (A) retry の様子: 2 回失敗してから成功する
    let mut greet = EnqueueRequest::new(
        project.clone(),
        TaskType::Exec,
        serde_json::to_value(GreetPayload {
            name: "foreman".to_string(),
        })?,
    );
    greet.max_attempts = Some(5);
    let task_id = app.enqueue(greet).await?;
    tracing::info!(%task_id, "greeting enqueued");

    // (B) パイプライン: REVIEW まで進んだら approve する
    let run = app.start_run(&project).await?;
    let mut reviewed = 0;
    loop {
        let current = app.run(run.id).await?;
        match current.state {
            RunState::Review => {
                app.review_run(run.id, ReviewAction::Approve).await?;
                reviewed += 1;
            }
            RunState::Done => break,
            _ => sleep(Duration::from_millis(50)).await,
        }
    }

    loop {
        let status = app.task_status(task_id).await?;
        if matches!(status.state, TaskState::Succeeded | TaskState::Failed) {
            println!("greeting: {}", serde_json::to_string_pretty(&status)?);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    let finished = app.run(run.id).await?;
    println!(
        "run {} finished: reason={:?} reviews={} spent_tokens={} actions={}",
        finished.id,
        finished.done_reason,
        reviewed,
        finished.budget.spent_tokens,
        finished.last_actions.len()
    );
    for item in backlog.items(&project).await {
        println!("  work item {:<10} done={}", item.id.as_str(), item.done);
    }
    println!(
        "health: {}",
        serde_json::to_string_pretty(&app.health().await)?
    );

    running.shutdown().await;
    Ok(())
}

async fn serve(config: ForemanConfig) -> Result<()> {
    let backlog = Arc::new(InMemoryBacklog::new());
    seed_demo_project(&backlog).await;
    let app = build_app(config, backlog)?;
    let running = app.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    running.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let config = cli.load_config()?;

    match cli.command {
        Command::Demo => demo(config).await,
        Command::Serve => serve(config).await,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
