use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    models::{FeedEntry, FeedKey, UserFilter},
    services::pipeline::RunSummary,
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// Body of a run trigger; an empty object runs every user
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub filter: UserFilter,
}

/// Rejects filters that cannot match anyone
pub fn validate_filter(filter: &UserFilter) -> AppResult<()> {
    match filter {
        UserFilter::Segment(segment) if segment.trim().is_empty() => Err(AppError::InvalidInput(
            "Segment filter cannot be empty".to_string(),
        )),
        UserFilter::Ids(ids) if ids.is_empty() => Err(AppError::InvalidInput(
            "Id filter needs at least one user id".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Reads the persisted feed of one user
pub async fn get_feed(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<FeedQuery>,
) -> AppResult<Json<FeedResponse>> {
    let key = match params.category {
        Some(category) if !category.trim().is_empty() => FeedKey::category(&user_id, category),
        _ => FeedKey::main(&user_id),
    };

    let entries = state
        .repository
        .user_feed(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No feed stored for {}", key)))?;

    Ok(Json(FeedResponse {
        user_id,
        category: key.category,
        entries,
    }))
}

/// Runs the feed pipeline for the requested users
pub async fn run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> AppResult<Json<RunSummary>> {
    validate_filter(&request.filter)?;
    let summary = state.pipeline.run(&request.filter).await?;
    Ok(Json(summary))
}
