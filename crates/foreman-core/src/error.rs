//! Crate-level error returned by the [`App`](crate::app::App) facade.

use thiserror::Error;

use crate::app::{BuildError, RegistryError, RunError};
use crate::config::ConfigError;
use crate::domain::TaskId;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ForemanError {
    /// True when the caller asked for something that is not there or not
    /// allowed right now, as opposed to an infrastructure failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ForemanError::TaskNotFound(_)
                | ForemanError::Run(RunError::NotFound(_) | RunError::NotInReview { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, RunState};
    use ulid::Ulid;

    #[test]
    fn review_in_wrong_state_is_a_client_error() {
        let err = ForemanError::from(RunError::NotInReview {
            run_id: RunId::from_ulid(Ulid::new()),
            state: RunState::Build,
        });
        assert!(err.is_client_error());
        assert!(err.to_string().contains("BUILD"));
    }

    #[test]
    fn storage_failure_is_not_a_client_error() {
        let err = ForemanError::from(StoreError::Unavailable("db down".into()));
        assert!(!err.is_client_error());
    }
}
