//! Latest-state reads.
//!
//! `GET /api/devices/{id}/latest` is a read-through over the KV cache:
//! the per-device raw-latest key holds the merged document for a few
//! seconds, long enough to absorb dashboard polling without touching
//! the database on every request.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::debug;

use crate::db;
use crate::AppState;

/// Cache lifetime for the raw-latest key.
const LATEST_TTL: Duration = Duration::from_secs(5);

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/devices/{device_id}/latest", get(handler))
}

async fn handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    // ---
    let cache_key = format!("latest_data_raw_{device_id}");
    if let Some(hit) = state.kv.get_json(&cache_key).await {
        debug!("GET latest for {device_id}: cache hit");
        return (StatusCode::OK, Json(hit)).into_response();
    }

    let id = device_id.clone();
    let loaded = state
        .db
        .safe_db_operation(false, move |pool| {
            let id = id.clone();
            async move { db::get_latest(&pool, &id).await }
        })
        .await;

    match loaded {
        Ok(Some(payload)) => {
            state.kv.set_json(&cache_key, &payload, LATEST_TTL).await;
            (StatusCode::OK, Json(payload)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_device", "device_id": device_id})),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                crate::error::StorageError::Backpressure(b) => b.status(),
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({"error": "storage", "detail": e.to_string()}))).into_response()
        }
    }
}
