//! InMemoryProofSink - 開発用の証跡ストア

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ProjectId, ProofRecord, RunId};
use crate::ports::{ProofSink, ProofSinkError};

#[derive(Default)]
pub struct InMemoryProofSink {
    records: Mutex<Vec<ProofRecord>>,
}

impl InMemoryProofSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in append order.
    pub async fn records(&self) -> Vec<ProofRecord> {
        self.records.lock().await.clone()
    }

    pub async fn for_project(&self, project: &ProjectId) -> Vec<ProofRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| &r.project_id == project)
            .cloned()
            .collect()
    }

    pub async fn for_run(&self, run_id: RunId) -> Vec<ProofRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.run_id == Some(run_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProofSink for InMemoryProofSink {
    async fn append(&self, record: ProofRecord) -> Result<(), ProofSinkError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
