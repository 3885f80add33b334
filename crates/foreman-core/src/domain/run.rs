//! Run record and the pipeline state graph.
//!
//! A run is one pass of a project through the pipeline:
//!
//! ```text
//! PLAN -> SELECT_TASK -> CODEGEN -> BUILD -> DEPLOY_PREVIEW -> EVAL -> REVIEW -> TEARDOWN -> DONE
//!              |                                                          |
//!              +--> DONE (no eligible work)        SELECT_TASK <-- redo --+
//! ```
//!
//! The record only knows which edges exist ([`RunState::can_transition_to`]).
//! What happens inside each state is the run state machine's business.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, RunId, TaskId, WorkItemId};
use super::outcome::Usage;
use super::task::TaskType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Plan,
    SelectTask,
    Codegen,
    Build,
    DeployPreview,
    Eval,
    Review,
    Teardown,
    Done,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        self == RunState::Done
    }

    /// Returns true if `self -> target` is an edge of the pipeline graph.
    pub fn can_transition_to(self, target: RunState) -> bool {
        use RunState::*;
        match self {
            Plan => target == SelectTask,
            SelectTask => matches!(target, Codegen | Done),
            Codegen => target == Build,
            Build => target == DeployPreview,
            DeployPreview => target == Eval,
            Eval => target == Review,
            Review => matches!(target, Teardown | SelectTask),
            Teardown => target == Done,
            Done => false,
        }
    }

    /// The state a work stage advances to on success.
    pub fn next_on_success(self) -> Option<RunState> {
        use RunState::*;
        match self {
            Plan => Some(SelectTask),
            Codegen => Some(Build),
            Build => Some(DeployPreview),
            DeployPreview => Some(Eval),
            Eval => Some(Review),
            Teardown => Some(Done),
            SelectTask | Review | Done => None,
        }
    }

    /// Queue task type that performs this stage's work, for stages that are
    /// executed through the task queue.
    pub fn stage_task_type(self) -> Option<TaskType> {
        use RunState::*;
        match self {
            Codegen => Some(TaskType::Codegen),
            Build => Some(TaskType::Build),
            DeployPreview => Some(TaskType::Deploy),
            Eval => Some(TaskType::Analyze),
            Teardown => Some(TaskType::Deploy),
            Plan | SelectTask | Review | Done => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        use RunState::*;
        match self {
            Plan => "PLAN",
            SelectTask => "SELECT_TASK",
            Codegen => "CODEGEN",
            Build => "BUILD",
            DeployPreview => "DEPLOY_PREVIEW",
            Eval => "EVAL",
            Review => "REVIEW",
            Teardown => "TEARDOWN",
            Done => "DONE",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human decision taken while a run sits in `REVIEW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Redo,
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewAction::Approve => f.write_str("approve"),
            ReviewAction::Redo => f.write_str("redo"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown review action: {0}")]
pub struct UnknownReviewAction(pub String);

impl FromStr for ReviewAction {
    type Err = UnknownReviewAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(ReviewAction::Approve),
            "redo" => Ok(ReviewAction::Redo),
            _ => Err(UnknownReviewAction(s.to_string())),
        }
    }
}

/// Why a run reached `DONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The selected work item went through review and teardown.
    Completed,
    /// `SELECT_TASK` found nothing to do.
    NoEligibleWork,
}

/// Spend limits and counters. `None` limits mean unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBudget {
    pub budget_tokens: Option<u64>,
    pub budget_usd: Option<f64>,
    pub spent_tokens: u64,
    pub spent_usd: f64,
}

impl RunBudget {
    pub fn new(budget_tokens: Option<u64>, budget_usd: Option<f64>) -> Self {
        Self {
            budget_tokens,
            budget_usd,
            spent_tokens: 0,
            spent_usd: 0.0,
        }
    }

    pub fn charge(&mut self, usage: Usage) {
        self.spent_tokens = self.spent_tokens.saturating_add(usage.tokens);
        self.spent_usd += usage.usd;
    }

    pub fn is_exhausted(&self) -> bool {
        let tokens_out = self
            .budget_tokens
            .is_some_and(|limit| self.spent_tokens >= limit);
        let usd_out = self.budget_usd.is_some_and(|limit| self.spent_usd >= limit);
        tokens_out || usd_out
    }
}

/// One entry of the run's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAction {
    pub at: DateTime<Utc>,
    pub from: RunState,
    pub to: RunState,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunTransitionError {
    #[error("invalid run transition {from} -> {to}")]
    InvalidEdge { from: RunState, to: RunState },
}

/// Per-project pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub state: RunState,

    /// Work item selected in `SELECT_TASK`.
    pub current_task_id: Option<WorkItemId>,

    /// Queue task the current stage is waiting on.
    pub stage_task_id: Option<TaskId>,

    /// Failed attempts in the current state since it was entered.
    pub stage_failures: u32,

    pub budget: RunBudget,
    pub last_actions: Vec<RunAction>,
    pub done_reason: Option<DoneReason>,

    /// Bumped by the run store on every successful update.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: RunId, project_id: ProjectId, budget: RunBudget, now: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id,
            state: RunState::Plan,
            current_task_id: None,
            stage_task_id: None,
            stage_failures: 0,
            budget,
            last_actions: Vec::new(),
            done_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move along one edge, logging it. Stage bookkeeping is reset because it
    /// belongs to the state being left.
    ///
    /// `log_limit` caps `last_actions`; the oldest entries are dropped first.
    pub fn transition_to(
        &mut self,
        target: RunState,
        note: impl Into<String>,
        now: DateTime<Utc>,
        log_limit: usize,
    ) -> Result<(), RunTransitionError> {
        if !self.state.can_transition_to(target) {
            return Err(RunTransitionError::InvalidEdge {
                from: self.state,
                to: target,
            });
        }

        self.last_actions.push(RunAction {
            at: now,
            from: self.state,
            to: target,
            note: note.into(),
        });
        if self.last_actions.len() > log_limit {
            let overflow = self.last_actions.len() - log_limit;
            self.last_actions.drain(..overflow);
        }

        self.state = target;
        self.stage_task_id = None;
        self.stage_failures = 0;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed stage attempt without leaving the state.
    pub fn record_stage_failure(&mut self, now: DateTime<Utc>) {
        self.stage_task_id = None;
        self.stage_failures = self.stage_failures.saturating_add(1);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn run() -> Run {
        Run::new(
            RunId::from_ulid(Ulid::new()),
            ProjectId::new("p-1"),
            RunBudget::default(),
            Utc::now(),
        )
    }

    #[rstest]
    #[case(RunState::Plan, RunState::SelectTask)]
    #[case(RunState::SelectTask, RunState::Codegen)]
    #[case(RunState::SelectTask, RunState::Done)]
    #[case(RunState::Codegen, RunState::Build)]
    #[case(RunState::Build, RunState::DeployPreview)]
    #[case(RunState::DeployPreview, RunState::Eval)]
    #[case(RunState::Eval, RunState::Review)]
    #[case(RunState::Review, RunState::Teardown)]
    #[case(RunState::Review, RunState::SelectTask)]
    #[case(RunState::Teardown, RunState::Done)]
    fn defined_edges_are_allowed(#[case] from: RunState, #[case] to: RunState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(RunState::Plan, RunState::Codegen)]
    #[case(RunState::Codegen, RunState::Review)]
    #[case(RunState::Review, RunState::Done)]
    #[case(RunState::Eval, RunState::SelectTask)]
    #[case(RunState::Done, RunState::Plan)]
    #[case(RunState::Done, RunState::SelectTask)]
    fn undefined_edges_are_rejected(#[case] from: RunState, #[case] to: RunState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn transition_logs_and_resets_stage_bookkeeping() {
        let mut r = run();
        r.stage_failures = 2;
        r.transition_to(RunState::SelectTask, "planned", Utc::now(), 10)
            .unwrap();

        assert_eq!(r.state, RunState::SelectTask);
        assert_eq!(r.stage_failures, 0);
        assert_eq!(r.last_actions.len(), 1);
        assert_eq!(r.last_actions[0].from, RunState::Plan);
    }

    #[test]
    fn invalid_transition_leaves_run_untouched() {
        let mut r = run();
        let before = r.clone();
        let err = r
            .transition_to(RunState::Review, "skip ahead", Utc::now(), 10)
            .unwrap_err();

        assert_eq!(
            err,
            RunTransitionError::InvalidEdge {
                from: RunState::Plan,
                to: RunState::Review
            }
        );
        assert_eq!(r, before);
    }

    #[test]
    fn action_log_is_capped() {
        let mut r = run();
        let now = Utc::now();
        r.transition_to(RunState::SelectTask, "1", now, 2).unwrap();
        r.transition_to(RunState::Codegen, "2", now, 2).unwrap();
        r.transition_to(RunState::Build, "3", now, 2).unwrap();

        let notes: Vec<_> = r.last_actions.iter().map(|a| a.note.as_str()).collect();
        assert_eq!(notes, vec!["2", "3"]);
    }

    #[test]
    fn budget_exhaustion_checks_either_limit() {
        let mut unlimited = RunBudget::default();
        unlimited.charge(Usage::new(1_000_000, 1_000.0));
        assert!(!unlimited.is_exhausted());

        let mut tokens = RunBudget::new(Some(100), None);
        tokens.charge(Usage::new(60, 0.0));
        assert!(!tokens.is_exhausted());
        tokens.charge(Usage::new(40, 0.0));
        assert!(tokens.is_exhausted());

        let mut usd = RunBudget::new(None, Some(1.0));
        usd.charge(Usage::new(0, 1.5));
        assert!(usd.is_exhausted());
    }

    #[test]
    fn review_action_parses() {
        assert_eq!("approve".parse::<ReviewAction>().unwrap(), ReviewAction::Approve);
        assert_eq!("REDO".parse::<ReviewAction>().unwrap(), ReviewAction::Redo);
        assert!("merge".parse::<ReviewAction>().is_err());
    }
}
