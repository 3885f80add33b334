//! InMemoryRunStore - テスト・開発用の Run 正本
//!
//! # 実装詳細
//! - `HashMap<RunId, Run>` が正本、`active` が project → 非 DONE の run
//! - tokio Mutex 1 本で排他制御（create と update が同じ臨界区間）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ProjectId, Run, RunId};
use crate::ports::{RunStore, RunStoreError, RunStoreResult};

#[derive(Default)]
struct Runs {
    by_id: HashMap<RunId, Run>,
    active: HashMap<ProjectId, RunId>,
    /// 作成順の run id（project ごと）
    history: HashMap<ProjectId, Vec<RunId>>,
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<Runs>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_active(&self, run: Run) -> RunStoreResult<Run> {
        let mut runs = self.runs.lock().await;
        if let Some(existing) = runs.active.get(&run.project_id) {
            return Err(RunStoreError::ActiveRunExists {
                project: run.project_id.clone(),
                run_id: *existing,
            });
        }

        if run.is_active() {
            runs.active.insert(run.project_id.clone(), run.id);
        }
        runs.history
            .entry(run.project_id.clone())
            .or_default()
            .push(run.id);
        runs.by_id.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: RunId) -> RunStoreResult<Option<Run>> {
        Ok(self.runs.lock().await.by_id.get(&id).cloned())
    }

    async fn find_active(&self, project: &ProjectId) -> RunStoreResult<Option<Run>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .active
            .get(project)
            .and_then(|id| runs.by_id.get(id))
            .cloned())
    }

    async fn latest(&self, project: &ProjectId) -> RunStoreResult<Option<Run>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .history
            .get(project)
            .and_then(|ids| ids.last())
            .and_then(|id| runs.by_id.get(id))
            .cloned())
    }

    async fn update(&self, run: &Run) -> RunStoreResult<Run> {
        let mut runs = self.runs.lock().await;
        let Some(stored) = runs.by_id.get_mut(&run.id) else {
            return Err(RunStoreError::NotFound(run.id));
        };
        if stored.state.is_terminal() {
            return Err(RunStoreError::Finalized(run.id));
        }
        if stored.version != run.version {
            return Err(RunStoreError::VersionConflict {
                run_id: run.id,
                expected: run.version,
                actual: stored.version,
            });
        }

        let mut next = run.clone();
        next.version = stored.version + 1;
        *stored = next.clone();

        if !next.is_active() {
            runs.active.remove(&next.project_id);
        }
        Ok(next)
    }

    async fn list_active(&self) -> RunStoreResult<Vec<Run>> {
        let runs = self.runs.lock().await;
        let mut active: Vec<Run> = runs
            .active
            .values()
            .filter_map(|id| runs.by_id.get(id))
            .cloned()
            .collect();
        active.sort_by_key(|run| run.created_at);
        Ok(active)
    }
}
