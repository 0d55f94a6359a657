use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::services::retry::RetryPolicy;

/// Updates per atomic commit accepted by the persistence layer
pub const MAX_BATCH_SIZE: usize = 500;

/// How a batch treats records that may or may not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Merge fields into records that already exist; missing records are skipped
    UpdateExisting,
    /// Create the record or replace it wholesale
    Overwrite,
}

/// Address of a persisted record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub collection: String,
    pub id: String,
}

impl RecordRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// One record update waiting to be committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateSpec {
    pub target: RecordRef,
    pub fields: Map<String, Value>,
}

/// Commits one chunk of updates as a single atomic operation
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BatchCommitter: Send + Sync {
    async fn commit(&self, chunk: &[BatchUpdateSpec], mode: WriteMode) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchSummary {
    pub chunks: usize,
    pub records: usize,
}

/// Splits updates into order-preserving chunks and commits them one at a time
///
/// Chunks are never committed concurrently: each commit is awaited before the
/// next one starts.
#[derive(Clone)]
pub struct BatchWriter {
    committer: Arc<dyn BatchCommitter>,
    max_batch_size: usize,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(
        committer: Arc<dyn BatchCommitter>,
        max_batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            committer,
            max_batch_size: max_batch_size.max(1),
            retry,
        }
    }

    pub async fn write(
        &self,
        specs: &[BatchUpdateSpec],
        mode: WriteMode,
    ) -> AppResult<BatchSummary> {
        let mut summary = BatchSummary::default();

        for (index, chunk) in specs.chunks(self.max_batch_size).enumerate() {
            if chunk.len() > MAX_BATCH_SIZE {
                return Err(AppError::BatchTooLarge {
                    size: chunk.len(),
                    limit: MAX_BATCH_SIZE,
                });
            }

            self.retry
                .run("batch_commit", || self.committer.commit(chunk, mode))
                .await?;

            summary.chunks += 1;
            summary.records += chunk.len();

            tracing::debug!(
                chunk = index,
                size = chunk.len(),
                mode = ?mode,
                "Committed batch chunk"
            );
        }

        if summary.chunks > 0 {
            tracing::info!(
                chunks = summary.chunks,
                records = summary.records,
                "Batch write completed"
            );
        }

        Ok(summary)
    }
}
