//! JSON status endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use super::HttpState;
use crate::registry::{StreamKey, StreamStats};

/// GET /api/server
pub(super) async fn server_info(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let stats = state.stats.snapshot();
    let streams = state.registry.stream_count().await;

    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": stats.uptime_secs,
        "connections": {
            "accepted": stats.accepted_connections,
            "active": stats.active_connections,
            "rejected": stats.rejected_connections,
        },
        "bytes_received": stats.bytes_received,
        "bytes_sent": stats.bytes_sent,
        "streams": streams,
    }))
}

/// GET /api/streams
pub(super) async fn list_streams(State(state): State<HttpState>) -> Json<Vec<StreamStats>> {
    Json(state.registry.list_streams().await)
}

/// GET /api/streams/:app/:name
pub(super) async fn stream_info(
    Path((app, name)): Path<(String, String)>,
    State(state): State<HttpState>,
) -> Result<Json<StreamStats>, StatusCode> {
    state
        .registry
        .stream_stats(&StreamKey::new(app, name))
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
