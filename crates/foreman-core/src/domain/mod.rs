//! Domain model (IDs, task types, runs, outcomes, proofs, work items, errors).
//!
//! Nothing here knows about storage or tokio; these are plain values that the
//! queue, the worker pool and the run state machine pass around.

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod proof;
pub mod run;
pub mod task;
pub mod work;

pub use errors::{CollaboratorError, ErrorKind, HandlerError};
pub use ids::{ProjectId, ProofId, RunId, TaskId, WorkItemId, WorkerId};
pub use outcome::{Outcome, OutcomeKind, Usage};
pub use proof::{ProofBody, ProofDraft, ProofRecord};
pub use run::{DoneReason, ReviewAction, Run, RunAction, RunBudget, RunState, RunTransitionError};
pub use task::{TaskEnvelope, TaskType, UnknownTaskType};
pub use work::{PlanSummary, WorkItem};
