//! Health and load surface.
//!
//! `GET /health` reports the state of every guarded subsystem: database
//! breaker and queue pressure, scheduler counters and degradation mode,
//! batch memory accounting, and the weather provider breakers. The
//! endpoint itself touches nothing external, so it answers even when
//! every dependency is down.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/health", get(handler))
}

async fn handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    // ---
    let scheduler = state.scheduler.snapshot();
    let memory_pressure = state.memory.system_pressure();
    let weather_breakers: Vec<_> = state
        .weather
        .service()
        .providers()
        .breaker_states()
        .iter()
        .map(|(name, st)| json!({"provider": name, "state": st.as_str()}))
        .collect();

    Json(json!({
        "status": "ok",
        "db": {
            "breaker": state.db.breaker_state(),
            "queue_pressure": state.db.queue_pressure(),
        },
        "scheduler": scheduler,
        "batch": {
            "active": state.memory.active_count(),
            "reserved_mb": state.memory.reserved_mb(),
            "memory_pressure": memory_pressure.as_str(),
        },
        "weather": {
            "breakers": weather_breakers,
            "cache_emergency_mode": state.weather.service().cache().emergency_mode(),
        },
    }))
}
