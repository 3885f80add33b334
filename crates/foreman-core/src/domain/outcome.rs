//! Outcome model: what a handler reports back for one attempt.
//!
//! This module does not assume queues or workers. It only fixes the "shape" of
//! results so the worker can turn them into `ack`/`fail` calls and proofs.

use serde::{Deserialize, Serialize};

use super::proof::ProofDraft;

/// Result classification of an attempt.
///
/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    /// Recoverable failure; the queue decides between retry and dead-letter.
    Failure,
}

/// Resources consumed by an attempt, charged against the run budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub usd: f64,
}

impl Usage {
    pub fn new(tokens: u64, usd: f64) -> Self {
        Self { tokens, usd }
    }
}

/// Common result format returned by every handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    /// Structured output, stored on the task when it succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Error text for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Evidence of what the attempt did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofDraft>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            output: None,
            reason: None,
            proof: None,
            usage: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            output: None,
            reason: Some(reason.into()),
            proof: None,
            usage: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_proof(mut self, proof: ProofDraft) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}
