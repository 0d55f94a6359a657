use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Concurrency limit must be at least 1, got {0}")]
    ConcurrencyBudgetExceeded(usize),

    #[error("Batch of {size} updates exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Programmer errors (bad limits, oversized batches, bad input) are fatal;
    /// persistence and network failures are retried by [`crate::services::retry`].
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::TypeNotFound { .. }
            ),
            AppError::Cache(_)
            | AppError::HttpClient(_)
            | AppError::TransientIo(_)
            | AppError::Timeout(_)
            | AppError::Worker(_) => true,
            AppError::Serialization(_)
            | AppError::ConcurrencyBudgetExceeded(_)
            | AppError::BatchTooLarge { .. }
            | AppError::NotFound(_)
            | AppError::InvalidInput(_)
            | AppError::Internal(_) => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::HttpClient(_) | AppError::Worker(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Serialization(_)
            | AppError::TransientIo(_)
            | AppError::ConcurrencyBudgetExceeded(_)
            | AppError::BatchTooLarge { .. }
            | AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
