//! Offline batch ingestion with SSE progress.
//!
//! `POST /api/batch` takes a JSON array of up to 5000 samples (50 MiB
//! body cap) and answers with a `text/event-stream` of processing
//! events: `started`, `processed`, `new_offline_session`,
//! `chunk_size_adjusted`, then `completed` or `error`.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tracing::info;

use crate::batch::generate_batch_id;
use crate::AppState;

use super::{client_ip, user_agent};

const MAX_BATCH_BYTES: usize = 50 * 1024 * 1024;
const MAX_BATCH_ITEMS: usize = 5000;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/batch", post(handler))
        .layer(DefaultBodyLimit::max(MAX_BATCH_BYTES))
}

async fn handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    // ---
    let Some(items) = body.as_array().cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "expected_array"})),
        )
            .into_response();
    };
    if items.len() > MAX_BATCH_ITEMS {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({
                "error": "too_many_items",
                "detail": format!("{} items, limit {MAX_BATCH_ITEMS}", items.len()),
            })),
        )
            .into_response();
    }

    let batch_id = generate_batch_id();
    info!("POST /api/batch {batch_id}: {} items", items.len());

    let events = state.stream.clone().process(
        items,
        client_ip(&headers, addr),
        user_agent(&headers),
        batch_id,
    );
    Sse::new(events.map(|v| Ok::<_, Infallible>(Event::default().data(v.to_string()))))
        .into_response()
}
