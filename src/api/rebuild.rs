use super::state::ApiState;
use crate::corpus::RunMode;
use crate::rebuild::RebuildStatus;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct TriggerQuery {
    #[serde(default)]
    full: bool,
}

/// Start a rebuild, or report the one already running.
pub(super) async fn trigger_rebuild(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TriggerQuery>,
) -> Json<RebuildStatus> {
    let mode = if query.full {
        RunMode::Full
    } else {
        RunMode::Incremental
    };
    Json(state.rebuilder.trigger(mode))
}

pub(super) async fn rebuild_status(State(state): State<Arc<ApiState>>) -> Json<RebuildStatus> {
    Json(state.rebuilder.status())
}
