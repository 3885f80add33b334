//! ProofSink port - 証跡（proof）の記録
//!
//! Append-only. Callers never read back through this port; anything that
//! reports on proofs goes to the backing store directly.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::ProofRecord;

#[async_trait]
pub trait ProofSink: Send + Sync {
    async fn append(&self, record: ProofRecord) -> Result<(), ProofSinkError>;
}

#[derive(Debug, Clone, Error)]
pub enum ProofSinkError {
    #[error("proof sink unavailable: {0}")]
    Unavailable(String),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}
