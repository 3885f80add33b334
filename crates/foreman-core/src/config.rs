//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Durations are plain millisecond integers on the wire
//! and `Duration`s in code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::run_machine::RunSettings;
use crate::app::status::HealthSettings;
use crate::app::worker_loop::WorkerSettings;
use crate::queue::{QueueDefaults, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForemanConfig {
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub runs: RunConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            retry_base_ms: 2_000,
            retry_multiplier: 2.0,
            retry_max_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn defaults(&self) -> QueueDefaults {
        QueueDefaults {
            max_attempts: self.default_max_attempts,
            retry: RetryPolicy::exponential(
                Duration::from_millis(self.retry_base_ms),
                self.retry_multiplier,
                Duration::from_millis(self.retry_max_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub visibility_ms: u64,
    /// Heartbeat every `visibility / heartbeat_divisor`.
    pub heartbeat_divisor: u32,
    pub idle_backoff_min_ms: u64,
    pub idle_backoff_max_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Worker ids are `{id_prefix}-{n}`.
    pub id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            visibility_ms: 30_000,
            heartbeat_divisor: 3,
            idle_backoff_min_ms: 100,
            idle_backoff_max_ms: 5_000,
            shutdown_grace_ms: 10_000,
            id_prefix: "worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.concurrency,
            visibility: Duration::from_millis(self.visibility_ms),
            heartbeat_divisor: self.heartbeat_divisor,
            idle_backoff_min: Duration::from_millis(self.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(self.idle_backoff_max_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            id_prefix: self.id_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// `max_attempts` of the queue tasks a stage enqueues.
    pub stage_max_attempts: u32,
    pub stage_priority: i32,
    pub action_log_limit: usize,
    pub budget_tokens: Option<u64>,
    pub budget_usd: Option<f64>,
}

impl Default for RunConfig {
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

impl RunConfig {
    pub fn settings(&self) -> RunSettings {
        RunSettings {
            stage_max_attempts: self.stage_max_attempts,
            stage_priority: self.stage_priority,
            action_log_limit: self.action_log_limit,
            budget_tokens: self.budget_tokens,
            budget_usd: self.budget_usd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub stale_tick_after_ms: u64,
    pub backlog_threshold: usize,
    pub stuck_after_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_tick_after_ms: 30_000,
            backlog_threshold: 100,
            stuck_after_failures: 3,
        }
    }
}

impl HealthConfig {
    pub fn settings(&self) -> HealthSettings {
        HealthSettings {
            stale_tick_after: Duration::from_millis(self.stale_tick_after_ms),
            backlog_threshold: self.backlog_threshold,
            stuck_after_failures: self.stuck_after_failures,
        }
    }
}

impl ForemanConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }

        if self.queue.default_max_attempts == 0 {
            return invalid("queue.default_max_attempts must be at least 1");
        }
        if !(self.queue.retry_multiplier.is_finite() && self.queue.retry_multiplier >= 1.0) {
            return invalid("queue.retry_multiplier must be a finite number >= 1.0");
        }
        if self.queue.retry_base_ms > self.queue.retry_max_ms {
            return invalid("queue.retry_base_ms must not exceed queue.retry_max_ms");
        }
        if self.workers.concurrency == 0 {
            return invalid("workers.concurrency must be at least 1");
        }
        if self.workers.visibility_ms == 0 {
            return invalid("workers.visibility_ms must be positive");
        }
        if self.workers.heartbeat_divisor < 2 {
            return invalid("workers.heartbeat_divisor must be at least 2");
        }
        if self.workers.idle_backoff_min_ms == 0
            || self.workers.idle_backoff_min_ms > self.workers.idle_backoff_max_ms
        {
            return invalid("workers.idle_backoff_min_ms must be in 1..=idle_backoff_max_ms");
        }
        if self.workers.id_prefix.trim().is_empty() {
            return invalid("workers.id_prefix must not be empty");
        }
        if self.scheduler.tick_interval_ms == 0 || self.scheduler.sweep_interval_ms == 0 {
            return invalid("scheduler intervals must be positive");
        }
        if self.runs.stage_max_attempts == 0 {
            return invalid("runs.stage_max_attempts must be at least 1");
        }
        if self.runs.action_log_limit == 0 {
            return invalid("runs.action_log_limit must be at least 1");
        }
        if self.runs.budget_usd.is_some_and(|usd| !usd.is_finite() || usd < 0.0) {
            return invalid("runs.budget_usd must be a non-negative number");
        }
        if self.health.stuck_after_failures == 0 {
            return invalid("health.stuck_after_failures must be at least 1");
        }
        Ok(())
    }
}
