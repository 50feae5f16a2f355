use std::net::SocketAddr;

use axum::http::HeaderMap;
use axum::Router;

use crate::AppState;

mod batch;
mod delta;
mod health;
mod latest;
mod telemetry;

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(telemetry::router())
        .merge(batch::router())
        .merge(delta::router())
        .merge(latest::router())
        .merge(health::router())
        .with_state(state)
}

/// Client address: `x-forwarded-for` when present, else the socket peer.
pub(crate) fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    // ---
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// User agent string, empty when absent.
pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    // ---
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn forwarded_header_wins_over_socket() {
        // ---
        let addr: SocketAddr = "10.0.0.9:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr), "10.0.0.9");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, addr), "203.0.113.7");
    }
}
