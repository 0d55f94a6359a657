use axum::{extract::State, Json};

use crate::{error::AppResult, services::pipeline::ProfileRefreshSummary};

use super::{
    feeds::{validate_filter, RunRequest},
    AppState,
};

/// Recomputes cached word-frequency profiles
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> AppResult<Json<ProfileRefreshSummary>> {
    validate_filter(&request.filter)?;
    let summary = state.pipeline.refresh_profiles(&request.filter).await?;
    Ok(Json(summary))
}
