use super::state::ApiState;
use crate::chunks::ChunkMetadata;
use crate::error::{Error, IndexError};
use crate::rebuild::RebuildState;
use crate::vector::IndexStats;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upper bound on `k`, whatever the request asks for.
const MAX_K: usize = 100;

#[derive(Deserialize)]
pub(super) struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
pub(super) struct SearchResult {
    id: String,
    text: String,
    distance: f32,
    metadata: ChunkMetadata,
}

#[derive(Serialize)]
pub(super) struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
}

pub(super) async fn search(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, StatusCode> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let k = request.k.unwrap_or(state.default_k).clamp(1, MAX_K);

    let hits = state.rebuilder.search(query, k).await.map_err(|error| match error {
        Error::Index(IndexError::NotFound(_)) => StatusCode::SERVICE_UNAVAILABLE,
        error => {
            tracing::warn!(%error, "search failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    Ok(Json(SearchResponse {
        query: query.to_string(),
        results: hits
            .into_iter()
            .map(|hit| SearchResult {
                id: hit.chunk.id,
                text: hit.chunk.text,
                distance: hit.distance,
                metadata: hit.chunk.metadata,
            })
            .collect(),
    }))
}

#[derive(Serialize)]
pub(super) struct StatsResponse {
    index: Option<IndexStats>,
    model_id: String,
    rebuild_state: RebuildState,
}

pub(super) async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    let rebuilder = &state.rebuilder;
    Json(StatsResponse {
        index: rebuilder.stats(),
        model_id: rebuilder.pipeline().encoder().model_id().to_string(),
        rebuild_state: rebuilder.status().state,
    })
}
