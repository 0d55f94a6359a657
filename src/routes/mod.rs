use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{
    middleware::{make_span_with_request_id, request_id_middleware},
    services::{dispatch::CHUNK_ENDPOINT, pipeline::FeedPipeline, repository::FeedRepository},
};

pub mod chunks;
pub mod feeds;
pub mod profiles;

/// Shared handles for every handler
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn FeedRepository>,
    pub pipeline: Arc<FeedPipeline>,
}

impl AppState {
    pub fn new(repository: Arc<dyn FeedRepository>, pipeline: Arc<FeedPipeline>) -> Self {
        Self {
            repository,
            pipeline,
        }
    }
}

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .route(CHUNK_ENDPOINT, post(chunks::process))
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/feeds/run", post(feeds::run))
        .route("/feeds/:user_id", get(feeds::get_feed))
        .route("/profiles/refresh", post(profiles::refresh))
}

async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}
