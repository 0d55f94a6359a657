use axum::{extract::State, Json};

use crate::{
    error::{AppError, AppResult},
    services::dispatch::{ChunkReport, ChunkRequest},
};

use super::AppState;

/// Worker side of the fan-out: ranks and persists one chunk of users
pub async fn process(
    State(state): State<AppState>,
    Json(request): Json<ChunkRequest>,
) -> AppResult<Json<ChunkReport>> {
    let limit = state.pipeline.settings().chunk_size.max(1);
    if request.user_ids.len() > limit {
        return Err(AppError::InvalidInput(format!(
            "Chunk of {} users exceeds the limit of {}",
            request.user_ids.len(),
            limit
        )));
    }

    tracing::info!(
        chunk = request.chunk_index,
        users = request.user_ids.len(),
        as_of = %request.as_of,
        "Chunk received"
    );

    let report = state.pipeline.run_chunk(request).await?;
    Ok(Json(report))
}
