//! Errors - エラー型と分類
//!
//! Every failure that crosses the handler or collaborator boundary carries an
//! [`ErrorKind`], which is what the worker and the run state machine act on.

use std::fmt;

use super::proof::ProofDraft;

/// ErrorKind は実行エラーの分類
///
/// - Transient: retried through `fail()` backoff up to `max_attempts`
/// - Permanent: retrying cannot help (unknown type, invalid payload)
/// - Infrastructure: storage or other shared dependency is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Error raised by a task handler instead of returning an [`Outcome`].
///
/// [`Outcome`]: super::Outcome
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} handler error: {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
    proof: Option<ProofDraft>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            proof: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn with_proof(mut self, proof: ProofDraft) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }

    pub fn take_proof(&mut self) -> Option<ProofDraft> {
        self.proof.take()
    }
}

/// Error raised by an external pipeline collaborator (planner, backlog,
/// project directory).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} collaborator error: {message}")]
pub struct CollaboratorError {
    kind: ErrorKind,
    message: String,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
