use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use driftio_core::{DataShardMarker, ZoneDataSync, ZoneSyncInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerState {
    pub zones: HashMap<String, Arc<ZoneDataSync>>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub source: String,
}

#[derive(Debug, Serialize)]
struct SyncStatusResponse {
    source_zone: String,
    info: ZoneSyncInfo,
    markers: HashMap<u32, DataShardMarker>,
}

#[derive(Debug, Deserialize)]
struct WakeupRequest {
    source: String,
    shard_id: u32,
    keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WakeupResponse {
    accepted: bool,
}

fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

async fn sync_status(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    let Some(zone) = state.zones.get(&query.source) else {
        return response_error(StatusCode::NOT_FOUND, "unknown source zone");
    };

    match zone.read_sync_status().await {
        Ok(Some((info, markers))) => (
            StatusCode::OK,
            Json(SyncStatusResponse {
                source_zone: query.source,
                info,
                markers,
            }),
        )
            .into_response(),
        Ok(None) => response_error(StatusCode::NOT_FOUND, "sync status not initialized"),
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

async fn sync_wakeup(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<WakeupRequest>,
) -> impl IntoResponse {
    let Some(zone) = state.zones.get(&request.source) else {
        return response_error(StatusCode::NOT_FOUND, "unknown source zone");
    };

    zone.wakeup(request.shard_id, request.keys);
    (StatusCode::OK, Json(WakeupResponse { accepted: true })).into_response()
}

pub async fn run_server(state: Arc<ServerState>, bind_addr: &str) -> driftio_core::Result<()> {
    let app = Router::new()
        .route("/admin/sync/status", get(sync_status))
        .route("/admin/sync/wakeup", post(sync_wakeup))
        .with_state(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("driftio admin API listening on {}", bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| driftio_core::DriftError::Internal(error.to_string()))
}
