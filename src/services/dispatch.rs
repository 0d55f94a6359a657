//! Cross-process fan-out of user chunks
//!
//! A coordinating run splits users into chunks and hands each one to a worker
//! through [`ChunkDispatcher`]. The HTTP implementation posts the chunk to a
//! sibling instance's internal endpoint, which ranks and persists it and
//! answers with a [`ChunkReport`].

use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::affinity::ProfileAccumulator;

/// Path of the worker endpoint chunks are posted to
pub const CHUNK_ENDPOINT: &str = "/internal/feed-chunks";

/// One shard of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk_index: usize,
    pub user_ids: Vec<String>,
    /// Clock of the coordinating run, so every chunk scores against the same instant
    pub as_of: DateTime<Utc>,
    /// Population sum computed once by the coordinator; a worker without one
    /// reads every user's history to build it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<ProfileAccumulator>,
}

/// What a worker did with one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkReport {
    pub users_ranked: usize,
    pub users_failed: usize,
    pub feeds_written: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChunkDispatcher: Send + Sync {
    async fn dispatch(&self, request: &ChunkRequest) -> AppResult<ChunkReport>;
}

#[derive(Clone)]
pub struct HttpChunkDispatcher {
    http_client: HttpClient,
    worker_url: String,
}

impl HttpChunkDispatcher {
    pub fn new(worker_url: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            worker_url: worker_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.worker_url, CHUNK_ENDPOINT)
    }
}

#[async_trait::async_trait]
impl ChunkDispatcher for HttpChunkDispatcher {
    async fn dispatch(&self, request: &ChunkRequest) -> AppResult<ChunkReport> {
        let response = self
            .http_client
            .post(self.endpoint())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            // The worker refused the chunk itself; resending it cannot succeed
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::InvalidInput(format!(
                "chunk {} rejected with status {}: {}",
                request.chunk_index, status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Worker(format!(
                "chunk {} failed with status {}: {}",
                request.chunk_index, status, body
            )));
        }

        let report: ChunkReport = response.json().await?;

        tracing::debug!(
            chunk = request.chunk_index,
            users = request.user_ids.len(),
            users_ranked = report.users_ranked,
            "Chunk dispatched"
        );

        Ok(report)
    }
}
