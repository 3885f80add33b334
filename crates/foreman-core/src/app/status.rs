//! Status - ループの生存監視とヘルスレポート
//!
//! `HealthProbe::check()` は詰まり理由（cause）を列挙して返す:
//! storage が落ちていれば `down`、それ以外の cause があれば `degraded`。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{ProjectId, RunId, RunState};
use crate::observability::QueueCounts;
use crate::ports::clock::elapsed;
use crate::ports::{Clock, RunStore};
use crate::queue::TaskQueue;

#[derive(Debug, Default)]
struct LoopState {
    alive: bool,
    last_tick_at: Option<DateTime<Utc>>,
    ticks: u64,
    errors: u64,
}

/// Shared liveness record of one background loop.
#[derive(Debug, Clone, Default)]
pub struct LoopMonitor {
    state: Arc<Mutex<LoopState>>,
}

/// Point-in-time copy of a [`LoopMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSnapshot {
    pub alive: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub errors: u64,
}

impl LoopMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_alive(&self, alive: bool) {
        self.lock().alive = alive;
    }

    pub fn record_tick(&self, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.last_tick_at = Some(at);
        state.ticks += 1;
    }

    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let state = self.lock();
        LoopSnapshot {
            alive: state.alive,
            last_tick_at: state.last_tick_at,
            ticks: state.ticks,
            errors: state.errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum HealthCause {
    /// The scheduler loop is not running or has not ticked recently.
    StaleTicker {
        #[serde(rename = "lastTickAt")]
        last_tick_at: Option<DateTime<Utc>>,
    },
    /// The lease sweep loop is not running or has not swept recently.
    StaleSweeper {
        #[serde(rename = "lastTickAt")]
        last_tick_at: Option<DateTime<Utc>>,
    },
    QueueBacklog { depth: usize, threshold: usize },
    StorageDisconnected { error: String },
    /// A run keeps failing in the same state.
    StageStuck {
        #[serde(rename = "runId")]
        run_id: RunId,
        #[serde(rename = "projectId")]
        project_id: ProjectId,
        state: RunState,
        failures: u32,
    },
    DeadLetters { count: usize },
    BudgetExhausted {
        #[serde(rename = "runId")]
        run_id: RunId,
        #[serde(rename = "projectId")]
        project_id: ProjectId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub loop_alive: bool,
    pub sweeper_alive: bool,
    pub queue_depth: Option<usize>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub counts: Option<QueueCounts>,
    pub causes: Vec<HealthCause>,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub stale_tick_after: Duration,
    pub backlog_threshold: usize,
    pub stuck_after_failures: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            stale_tick_after: Duration::from_secs(30),
            backlog_threshold: 100,
            stuck_after_failures: 3,
        }
    }
}

pub struct HealthProbe {
    queue: TaskQueue,
    runs: Arc<dyn RunStore>,
    scheduler: LoopMonitor,
    sweeper: LoopMonitor,
    clock: Arc<dyn Clock>,
    settings: HealthSettings,
}

impl HealthProbe {
    pub fn new(
        queue: TaskQueue,
        runs: Arc<dyn RunStore>,
        scheduler: LoopMonitor,
        sweeper: LoopMonitor,
        clock: Arc<dyn Clock>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            queue,
            runs,
            scheduler,
            sweeper,
            clock,
            settings,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let now = self.clock.now();
        let ticker = self.scheduler.snapshot();
        let sweeper = self.sweeper.snapshot();
        let mut causes = Vec::new();

        if self.is_stale(&ticker, now) {
            causes.push(HealthCause::StaleTicker {
                last_tick_at: ticker.last_tick_at,
            });
        }
        if self.is_stale(&sweeper, now) {
            causes.push(HealthCause::StaleSweeper {
                last_tick_at: sweeper.last_tick_at,
            });
        }

        let (queue_depth, counts) = match self.queue_stats().await {
            Ok((depth, counts)) => (Some(depth), Some(counts)),
            Err(error) => {
                causes.push(HealthCause::StorageDisconnected { error });
                (None, None)
            }
        };

        if let Some(depth) = queue_depth
            && depth > self.settings.backlog_threshold
        {
            causes.push(HealthCause::QueueBacklog {
                depth,
                threshold: self.settings.backlog_threshold,
            });
        }
        if let Some(counts) = counts
            && counts.failed > 0
        {
            causes.push(HealthCause::DeadLetters {
                count: counts.failed,
            });
        }

        match self.runs.list_active().await {
            Ok(active) => {
                for run in active {
                    if run.stage_failures >= self.settings.stuck_after_failures {
                        causes.push(HealthCause::StageStuck {
                            run_id: run.id,
                            project_id: run.project_id.clone(),
                            state: run.state,
                            failures: run.stage_failures,
                        });
                    }
                    if run.budget.is_exhausted() {
                        causes.push(HealthCause::BudgetExhausted {
                            run_id: run.id,
                            project_id: run.project_id,
                        });
                    }
                }
            }
            Err(err) => causes.push(HealthCause::StorageDisconnected {
                error: err.to_string(),
            }),
        }

        let status = if causes
            .iter()
            .any(|c| matches!(c, HealthCause::StorageDisconnected { .. }))
        {
            HealthStatus::Down
        } else if causes.is_empty() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            timestamp: now,
            loop_alive: ticker.alive,
            sweeper_alive: sweeper.alive,
            queue_depth,
            last_tick_at: ticker.last_tick_at,
            counts,
            causes,
        }
    }

    fn is_stale(&self, snapshot: &LoopSnapshot, now: DateTime<Utc>) -> bool {
        let fresh = snapshot
            .last_tick_at
            .is_some_and(|at| elapsed(at, now) <= self.settings.stale_tick_after);
        !snapshot.alive || !fresh
    }

    async fn queue_stats(&self) -> Result<(usize, QueueCounts), String> {
        self.queue.ping().await.map_err(|e| e.to_string())?;
        let depth = self.queue.depth().await.map_err(|e| e.to_string())?;
        let counts = self.queue.counts().await.map_err(|e| e.to_string())?;
        Ok((depth, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Run, RunBudget, TaskType, Usage, WorkerId};
    use crate::impls::InMemoryRunStore;
    use crate::ports::{ManualClock, UlidGenerator};
    use crate::queue::{InMemoryTaskStore, NewTask, QueueDefaults, TaskFailure};
    use rstest::{fixture, rstest};
    use ulid::Ulid;

    struct Harness {
        probe: HealthProbe,
        queue: TaskQueue,
        store: Arc<InMemoryTaskStore>,
        runs: Arc<InMemoryRunStore>,
        monitor: LoopMonitor,
        sweeper: LoopMonitor,
        clock: ManualClock,
    }

    #[fixture]
    fn harness() -> Harness {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = TaskQueue::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            QueueDefaults::default(),
        );
        let runs = Arc::new(InMemoryRunStore::new());
        let monitor = LoopMonitor::new();
        let sweeper = LoopMonitor::new();
        let probe = HealthProbe::new(
            queue.clone(),
            runs.clone(),
            monitor.clone(),
            sweeper.clone(),
            Arc::new(clock.clone()),
            HealthSettings {
                stale_tick_after: Duration::from_secs(30),
                backlog_threshold: 2,
                stuck_after_failures: 3,
            },
        );
        Harness {
            probe,
            queue,
            store,
            runs,
            monitor,
            sweeper,
            clock,
        }
    }

    fn tick_now(h: &Harness) {
        for monitor in [&h.monitor, &h.sweeper] {
            monitor.set_alive(true);
            monitor.record_tick(h.clock.now());
        }
    }

    #[rstest]
    #[tokio::test]
    async fn healthy_when_nothing_is_wrong(harness: Harness) {
        tick_now(&harness);
        let report = harness.probe.check().await;

        assert_eq!(report.status, HealthStatus::Ok);
        assert!(report.causes.is_empty());
        assert_eq!(report.queue_depth, Some(0));
    }

    #[rstest]
    #[tokio::test]
    async fn stale_ticker_degrades(harness: Harness) {
        tick_now(&harness);
        harness.clock.advance(Duration::from_secs(31));
        harness.sweeper.record_tick(harness.clock.now());

        let report = harness.probe.check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(matches!(report.causes[..], [HealthCause::StaleTicker { .. }]));
    }

    #[rstest]
    #[tokio::test]
    async fn stopped_sweeper_degrades(harness: Harness) {
        tick_now(&harness);
        let last = harness.clock.now();
        harness.sweeper.set_alive(false);

        let report = harness.probe.check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.loop_alive);
        assert!(!report.sweeper_alive);
        assert_eq!(
            report.causes,
            vec![HealthCause::StaleSweeper {
                last_tick_at: Some(last)
            }]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn storage_loss_is_down(harness: Harness) {
        tick_now(&harness);
        harness.store.set_available(false);

        let report = harness.probe.check().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert_eq!(report.queue_depth, None);
        assert!(report
            .causes
            .iter()
            .any(|c| matches!(c, HealthCause::StorageDisconnected { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn backlog_and_dead_letters_are_reported(harness: Harness) {
        tick_now(&harness);
        let task = || NewTask::new(ProjectId::new("p"), TaskType::Exec, serde_json::json!({}));
        for _ in 0..3 {
            harness.queue.enqueue(task()).await.unwrap();
        }
        let dead = harness.queue.enqueue(task().max_attempts(1).priority(9)).await.unwrap();
        let w = WorkerId::new("w");
        harness.queue.reserve(&w, Duration::from_secs(5)).await.unwrap();
        harness
            .queue
            .fail(dead, &w, TaskFailure::new("nope", Duration::ZERO))
            .await
            .unwrap();

        let report = harness.probe.check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.causes.contains(&HealthCause::QueueBacklog {
            depth: 3,
            threshold: 2
        }));
        assert!(report.causes.contains(&HealthCause::DeadLetters { count: 1 }));
    }

    #[rstest]
    #[tokio::test]
    async fn stuck_and_over_budget_runs_are_reported(harness: Harness) {
        tick_now(&harness);
        let mut run = Run::new(
            RunId::from_ulid(Ulid::new()),
            ProjectId::new("p"),
            RunBudget::new(Some(10), None),
            harness.clock.now(),
        );
        run.stage_failures = 3;
        run.budget.charge(Usage::new(10, 0.0));
        harness.runs.create_active(run.clone()).await.unwrap();

        let report = harness.probe.check().await;
        assert!(report.causes.contains(&HealthCause::StageStuck {
            run_id: run.id,
            project_id: run.project_id.clone(),
            state: RunState::Plan,
            failures: 3,
        }));
        assert!(report.causes.contains(&HealthCause::BudgetExhausted {
            run_id: run.id,
            project_id: run.project_id,
        }));
    }

    #[test]
    fn report_serializes_with_cause_tags() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            timestamp: Utc::now(),
            loop_alive: true,
            sweeper_alive: true,
            queue_depth: Some(120),
            last_tick_at: None,
            counts: None,
            causes: vec![HealthCause::QueueBacklog {
                depth: 120,
                threshold: 100,
            }],
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status"], "degraded");
        assert_eq!(v["loopAlive"], true);
        assert_eq!(v["causes"][0]["cause"], "queue_backlog");
        assert_eq!(v["causes"][0]["depth"], 120);
    }
}
