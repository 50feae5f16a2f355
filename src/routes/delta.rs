//! Delta batch ingestion with SSE progress.
//!
//! `POST /api/batch-delta` takes a JSON array of partial samples and
//! streams progress events every few deltas, ending with `completed` or
//! `error`. Each delta must name its device; batches where more than
//! one in ten items are anonymous are rejected up front by the
//! processor.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
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

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/batch-delta", post(handler))
}

async fn handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    // ---
    let Some(deltas) = body.as_array().cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "expected_array"})),
        )
            .into_response();
    };

    let batch_id = generate_batch_id();
    info!("POST /api/batch-delta {batch_id}: {} deltas", deltas.len());

    let events = state.delta.clone().process(
        deltas,
        client_ip(&headers, addr),
        user_agent(&headers),
        batch_id,
    );
    Sse::new(events.map(|v| Ok::<_, Infallible>(Event::default().data(v.to_string()))))
        .into_response()
}
