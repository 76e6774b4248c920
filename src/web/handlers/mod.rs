use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::engine::SourceInfo;
use crate::error::{AppError, Result};
use crate::graph::GraphSnapshot;
use crate::state::AppState;
use crate::webrtc::{StartStreamResponse, StreamStatus};

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn ready() -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Effective configuration as loaded at startup (CLI overrides excluded)
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json((*state.config.get()).clone())
}

// ============================================================================
// Recording
// ============================================================================

pub async fn list_sources(State(state): State<Arc<AppState>>) -> Json<Vec<SourceInfo>> {
    Json(state.engine.sources())
}

#[derive(Serialize)]
pub struct RecordResponse {
    pub success: bool,
    pub video_path: String,
}

/// Trigger a clip; may block up to the start wait while a previous clip settles
pub async fn record(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Result<Json<RecordResponse>> {
    let engine = state.engine.clone();
    let path = tokio::task::spawn_blocking(move || engine.record(&source_id))
        .await
        .map_err(|e| AppError::Internal(format!("record task failed: {}", e)))??;

    Ok(Json(RecordResponse {
        success: true,
        video_path: path.to_string_lossy().to_string(),
    }))
}

// ============================================================================
// Streaming
// ============================================================================

pub async fn stream_start(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<String>,
) -> Result<Json<StartStreamResponse>> {
    if peer_id.trim().is_empty() {
        return Err(AppError::BadRequest("peer id must not be empty".to_string()));
    }
    info!("Stream requested for peer {}", peer_id);
    Ok(Json(state.engine.start_stream(&peer_id).await))
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

pub async fn stream_stop(State(state): State<Arc<AppState>>) -> Json<SuccessResponse> {
    state.engine.stop_stream().await;
    Json(SuccessResponse { success: true })
}

pub async fn stream_status(State(state): State<Arc<AppState>>) -> Json<StreamStatus> {
    Json(state.engine.stream_status().await)
}

// ============================================================================
// Graph
// ============================================================================

pub async fn graph_snapshot(State(state): State<Arc<AppState>>) -> Json<GraphSnapshot> {
    Json(state.engine.snapshot())
}
