//! Single-sample telemetry ingestion.
//!
//! `POST /api/telemetry` accepts up to 5 MiB; the `x-compression-type:
//! maximum` header selects the fixed-layout binary codec, anything else
//! goes through the deflate/gzip/JSON sniffing decoder. The handler does
//! no storage work itself: it validates, then enqueues one CRITICAL
//! storage task and one state-update task whose priority follows the
//! current degradation mode.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::codec;
use crate::db::{self, TimestampedRecord};
use crate::merge::resolve_device_id;
use crate::pressure::PressureLevel;
use crate::scheduler::{Priority, Task};
use crate::timestamp;
use crate::validate;
use crate::AppState;

use super::client_ip;

const MAX_TELEMETRY_BYTES: usize = 5 * 1024 * 1024;

/// Process-wide sequence for unique task ids.
static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/telemetry", post(handler))
        .layer(DefaultBodyLimit::max(MAX_TELEMETRY_BYTES))
}

async fn handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // ---
    let source_ip = client_ip(&headers, addr);
    let binary = headers
        .get("x-compression-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("maximum"));

    let sample = match if binary {
        codec::decode_binary(&body)
    } else {
        codec::decode(&body)
    } {
        Ok(v) => v,
        Err(e) => {
            debug!("POST /api/telemetry decode failed: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "decode_failed", "detail": e.to_string()})),
            )
                .into_response();
        }
    };

    let validation = validate::validate(&sample);
    if !validation.valid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "validation_failed",
                "detail": validation.errors.into_iter().take(5).collect::<Vec<_>>(),
            })),
        )
            .into_response();
    }

    let device_id = resolve_device_id(&sample, &source_ip);
    let data_timestamp = timestamp::extract(&sample).unwrap_or_else(Utc::now);
    let mode = state
        .scheduler
        .degradation_mode_with(state.memory.system_pressure());

    // Durability first: the history insert is the one task that must
    // not be shed.
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    let storage_id = format!("storage_{seq}_{device_id}");
    let storage_task = storage_task(&state, &storage_id, &device_id, sample.clone(), data_timestamp);
    if !state.scheduler.enqueue(storage_task) {
        warn!("critical queue full, refusing telemetry for {device_id}");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "queue_full", "detail": "critical queue at capacity"})),
        )
            .into_response();
    }

    let state_priority = state_priority(mode);
    let state_id = format!("state_{seq}_{device_id}");
    let accepted_state = state
        .scheduler
        .enqueue(state_task(&state, &state_id, &device_id, sample.clone(), state_priority));
    if !accepted_state {
        debug!("state task dropped for {device_id} at mode {}", mode.as_str());
    }

    info!(
        "POST /api/telemetry accepted {device_id} (mode {}, state {})",
        mode.as_str(),
        state_priority.as_str()
    );
    (
        StatusCode::OK,
        Json(json!({
            "status": "accepted",
            "device_id": device_id,
            "storage_task": storage_id,
            "state_task": accepted_state.then_some(state_id),
            "degradation_mode": mode.as_str(),
            "data_timestamp": data_timestamp.to_rfc3339(),
            "warnings": validation.warnings,
            "telemetry": sample,
        })),
    )
        .into_response()
}

/// State-update priority under the current degradation mode: shed at
/// HIGH and above, catch up faster at MEDIUM.
fn state_priority(mode: PressureLevel) -> Priority {
    // ---
    match mode {
        PressureLevel::High | PressureLevel::Critical => Priority::Low,
        PressureLevel::Medium => Priority::High,
        PressureLevel::Low => Priority::Normal,
    }
}

/// CRITICAL history insert. Failures propagate so the scheduler's
/// counters and the pool breaker both see them.
fn storage_task(
    state: &AppState,
    task_id: &str,
    device_id: &str,
    sample: Value,
    data_timestamp: chrono::DateTime<chrono::Utc>,
) -> Task {
    // ---
    let db = state.db.clone();
    let partitions = state.partitions.clone();
    let rec = TimestampedRecord {
        device_id: device_id.to_string(),
        payload: sample,
        data_timestamp,
        data_type: "telemetry",
        is_offline: false,
        batch_id: None,
    };
    Task::new(task_id, Priority::Critical, move || {
        let db = db.clone();
        let partitions = partitions.clone();
        let rec = rec.clone();
        async move {
            db.safe_db_operation(true, move |pool| {
                let rec = rec.clone();
                let partitions = partitions.clone();
                async move {
                    partitions.ensure_partition(&pool, rec.data_timestamp).await?;
                    db::insert_timestamped(&pool, &rec).await?;
                    db::enqueue_ingested(&pool, &rec.device_id, &rec.payload).await?;
                    Ok(())
                }
            })
            .await?;
            Ok(())
        }
    })
}

/// Best-effort latest-state refresh: enrich, upsert, invalidate. Errors
/// are logged and swallowed; the next sample repairs the state.
fn state_task(
    state: &AppState,
    task_id: &str,
    device_id: &str,
    sample: Value,
    priority: Priority,
) -> Task {
    // ---
    let db = state.db.clone();
    let kv = state.kv.clone();
    let weather = state.weather.clone();
    let mode = state.config.latest_write_mode;
    let device_id = device_id.to_string();
    Task::new(task_id, priority, move || {
        let db = db.clone();
        let kv = kv.clone();
        let weather = weather.clone();
        let device_id = device_id.clone();
        let mut sample = sample.clone();
        async move {
            weather.enrich(&device_id, &mut sample).await;

            let payload = sample.clone();
            let id = device_id.clone();
            let result = db
                .safe_db_operation(false, move |pool| {
                    let payload = payload.clone();
                    let id = id.clone();
                    async move { db::upsert_latest(&pool, &id, &payload, mode).await }
                })
                .await;
            match result {
                Ok(()) => kv.invalidate("latest_data", Some(&device_id)),
                Err(e) => warn!("state update for {device_id} failed: {e}"),
            }
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn state_priority_follows_degradation_mode() {
        // ---
        assert_eq!(state_priority(PressureLevel::Low), Priority::Normal);
        assert_eq!(state_priority(PressureLevel::Medium), Priority::High);
        assert_eq!(state_priority(PressureLevel::High), Priority::Low);
        assert_eq!(state_priority(PressureLevel::Critical), Priority::Low);
    }
}
