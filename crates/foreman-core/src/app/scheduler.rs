//! Scheduler - active project ごとに run を用意して tick する
//!
//! Every interval the scheduler asks the [`ProjectDirectory`] for active
//! projects and spawns one tick per project on a [`JoinSet`]. A project whose
//! previous tick has not finished is skipped for this round. Errors and
//! panics of one project are logged and counted on the [`LoopMonitor`]; the
//! other projects keep going.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::domain::ProjectId;
use crate::ports::{Clock, ProjectDirectory};

use super::run_machine::{RunError, RunStateMachine, TickOutcome};
use super::status::LoopMonitor;

type InFlightSet = Arc<Mutex<HashSet<ProjectId>>>;

/// Marks a project as being ticked until dropped, including by a panic.
struct InFlight {
    set: InFlightSet,
    project: ProjectId,
}

impl InFlight {
    fn acquire(set: &InFlightSet, project: &ProjectId) -> Option<Self> {
        let mut projects = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !projects.insert(project.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            project: project.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.project);
    }
}

pub struct Scheduler {
    machine: Arc<RunStateMachine>,
    projects: Arc<dyn ProjectDirectory>,
    clock: Arc<dyn Clock>,
    monitor: LoopMonitor,
    interval: Duration,
    in_flight: InFlightSet,
    ticks: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        machine: Arc<RunStateMachine>,
        projects: Arc<dyn ProjectDirectory>,
        clock: Arc<dyn Clock>,
        monitor: LoopMonitor,
        interval: Duration,
    ) -> Self {
        Self {
            machine,
            projects,
            clock,
            monitor,
            interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            ticks: JoinSet::new(),
        }
    }

    pub fn monitor(&self) -> &LoopMonitor {
        &self.monitor
    }

    /// One round over the active projects. Returns how many project ticks
    /// were spawned.
    pub async fn sweep(&mut self) -> usize {
        while let Some(finished) = self.ticks.try_join_next() {
            self.reap(finished);
        }
        self.monitor.record_tick(self.clock.now());

        let projects = match self.projects.active_projects().await {
            Ok(projects) => projects,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list active projects");
                self.monitor.record_error();
                return 0;
            }
        };

        let mut spawned = 0;
        for project in projects {
            let Some(guard) = InFlight::acquire(&self.in_flight, &project) else {
                tracing::debug!(%project, "previous tick still running, skipped");
                continue;
            };
            let machine = Arc::clone(&self.machine);
            let monitor = self.monitor.clone();
            self.ticks.spawn(async move {
                let _guard = guard;
                match tick_project(&machine, &project).await {
                    Ok(Some(outcome)) => tracing::debug!(%project, ?outcome, "project ticked"),
                    Ok(None) => tracing::trace!(%project, "no run needed"),
                    Err(err) => {
                        tracing::warn!(%project, error = %err, "project tick failed");
                        monitor.record_error();
                    }
                }
            });
            spawned += 1;
        }
        spawned
    }

    /// Waits for every in-flight project tick.
    pub async fn drain(&mut self) {
        while let Some(finished) = self.ticks.join_next().await {
            self.reap(finished);
        }
    }

    /// Ticks until `shutdown` flips, then waits for in-flight ticks.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.monitor.set_alive(true);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.drain().await;
        self.monitor.set_alive(false);
        tracing::info!("scheduler stopped");
    }

    fn reap(&self, finished: Result<(), JoinError>) {
        if let Err(err) = finished {
            if err.is_panic() {
                tracing::error!(error = %err, "project tick panicked");
            } else {
                tracing::warn!(error = %err, "project tick cancelled");
            }
            self.monitor.record_error();
        }
    }
}

async fn tick_project(
    machine: &RunStateMachine,
    project: &ProjectId,
) -> Result<Option<TickOutcome>, RunError> {
    let Some(run) = machine.ensure_active(project).await? else {
        return Ok(None);
    };
    machine.tick(run.id).await.map(Some)
}
