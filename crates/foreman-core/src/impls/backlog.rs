//! InMemoryBacklog - 開発用の planner / backlog / project directory
//!
//! One type implements all three pipeline ports so a demo or a test can seed
//! a project's plan and watch runs consume it.
//!
//! - `seed_plan()` で project ごとの「計画」を登録（planner が返す内容）
//! - `plan()` で初回だけ計画を backlog に展開する（2 回目以降は何もしない）

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CollaboratorError, PlanSummary, ProjectId, WorkItem, WorkItemId};
use crate::ports::{Backlog, Planner, ProjectDirectory};

#[derive(Default)]
struct Projects {
    active: Vec<ProjectId>,
    /// planner が展開する予定の work item
    plans: HashMap<ProjectId, Vec<WorkItem>>,
    /// 展開済みの backlog
    backlogs: HashMap<ProjectId, Vec<WorkItem>>,
    planned: HashSet<ProjectId>,
}

#[derive(Default)]
pub struct InMemoryBacklog {
    projects: Mutex<Projects>,
}

impl InMemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active project whose planner yields `items`.
    pub async fn seed_plan(&self, project: ProjectId, items: Vec<WorkItem>) {
        let mut projects = self.projects.lock().await;
        if !projects.active.contains(&project) {
            projects.active.push(project.clone());
        }
        projects.plans.insert(project, items);
    }

    /// Appends work to an already planned project's backlog.
    pub async fn push_item(&self, project: &ProjectId, item: WorkItem) {
        let mut projects = self.projects.lock().await;
        projects
            .backlogs
            .entry(project.clone())
            .or_default()
            .push(item);
    }

    pub async fn set_blocked(&self, project: &ProjectId, id: &WorkItemId, blocked: bool) {
        let mut projects = self.projects.lock().await;
        if let Some(item) = projects
            .backlogs
            .get_mut(project)
            .and_then(|items| items.iter_mut().find(|item| &item.id == id))
        {
            item.blocked = blocked;
        }
    }

    pub async fn deactivate(&self, project: &ProjectId) {
        self.projects.lock().await.active.retain(|p| p != project);
    }

    pub async fn items(&self, project: &ProjectId) -> Vec<WorkItem> {
        self.projects
            .lock()
            .await
            .backlogs
            .get(project)
            .cloned()
            .unwrap_or_default()
    }
}

fn is_eligible(item: &WorkItem, items: &[WorkItem]) -> bool {
    if item.done || item.blocked {
        return false;
    }
    item.depends_on.iter().all(|dep| {
        items
            .iter()
            .find(|other| &other.id == dep)
            .is_some_and(|other| other.done)
    })
}

#[async_trait]
impl Planner for InMemoryBacklog {
    async fn plan(&self, project: &ProjectId) -> Result<PlanSummary, CollaboratorError> {
        let mut projects = self.projects.lock().await;
        if projects.planned.contains(project) {
            let total = projects.backlogs.get(project).map_or(0, Vec::len);
            return Ok(PlanSummary { total, created: 0 });
        }

        let planned = projects.plans.get(project).cloned().unwrap_or_default();
        let backlog = projects.backlogs.entry(project.clone()).or_default();
        let created = planned.len();
        backlog.extend(planned);
        let total = backlog.len();
        projects.planned.insert(project.clone());
        Ok(PlanSummary { total, created })
    }
}

#[async_trait]
impl Backlog for InMemoryBacklog {
    async fn next_eligible(
        &self,
        project: &ProjectId,
    ) -> Result<Option<WorkItem>, CollaboratorError> {
        let projects = self.projects.lock().await;
        let Some(items) = projects.backlogs.get(project) else {
            return Ok(None);
        };
        Ok(items
            .iter()
            .filter(|item| is_eligible(item, items))
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn item(
        &self,
        project: &ProjectId,
        id: &WorkItemId,
    ) -> Result<Option<WorkItem>, CollaboratorError> {
        let projects = self.projects.lock().await;
        Ok(projects
            .backlogs
            .get(project)
            .and_then(|items| items.iter().find(|item| &item.id == id))
            .cloned())
    }

    async fn mark_done(
        &self,
        project: &ProjectId,
        id: &WorkItemId,
    ) -> Result<(), CollaboratorError> {
        let mut projects = self.projects.lock().await;
        let item = projects
            .backlogs
            .get_mut(project)
            .and_then(|items| items.iter_mut().find(|item| &item.id == id))
            .ok_or_else(|| {
                CollaboratorError::new(
                    crate::domain::ErrorKind::Permanent,
                    format!("work item {id} not found in project {project}"),
                )
            })?;
        item.done = true;
        Ok(())
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryBacklog {
    async fn active_projects(&self) -> Result<Vec<ProjectId>, CollaboratorError> {
        Ok(self.projects.lock().await.active.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn item(id: &str, minutes_ago: i64) -> WorkItem {
        WorkItem::new(id, format!("item {id}"), Utc::now() - Duration::minutes(minutes_ago))
    }

    #[tokio::test]
    async fn plan_is_idempotent() {
        let backlog = InMemoryBacklog::new();
        let p = ProjectId::new("p");
        backlog.seed_plan(p.clone(), vec![item("a", 2), item("b", 1)]).await;

        let first = backlog.plan(&p).await.unwrap();
        let second = backlog.plan(&p).await.unwrap();

        assert_eq!(first, PlanSummary { total: 2, created: 2 });
        assert_eq!(second, PlanSummary { total: 2, created: 0 });
        assert_eq!(backlog.items(&p).await.len(), 2);
    }

    #[tokio::test]
    async fn next_eligible_respects_dependencies_and_blocks() {
        let backlog = InMemoryBacklog::new();
        let p = ProjectId::new("p");
        backlog
            .seed_plan(
                p.clone(),
                vec![
                    item("schema", 3),
                    item("api", 5).depending_on("schema"),
                    item("docs", 1),
                ],
            )
            .await;
        backlog.plan(&p).await.unwrap();

        // "api" is oldest but waits for "schema"
        let next = backlog.next_eligible(&p).await.unwrap().unwrap();
        assert_eq!(next.id.as_str(), "schema");

        backlog.set_blocked(&p, &WorkItemId::new("schema"), true).await;
        let next = backlog.next_eligible(&p).await.unwrap().unwrap();
        assert_eq!(next.id.as_str(), "docs");

        backlog.set_blocked(&p, &WorkItemId::new("schema"), false).await;
        backlog.mark_done(&p, &WorkItemId::new("schema")).await.unwrap();
        let next = backlog.next_eligible(&p).await.unwrap().unwrap();
        assert_eq!(next.id.as_str(), "api");
    }

    #[tokio::test]
    async fn unplanned_project_has_no_work() {
        let backlog = InMemoryBacklog::new();
        assert!(backlog
            .next_eligible(&ProjectId::new("nobody"))
            .await
            .unwrap()
            .is_none());
    }
}
