//! Error taxonomy for the ingestion core.
//!
//! Errors are grouped by how the caller must react, not by which crate
//! produced them: backpressure is retryable by the client (429/503),
//! malformed input is not (400), and best-effort subsystems (cache,
//! enrichment, invalidation) degrade to `None` instead of surfacing.

use axum::http::StatusCode;
use thiserror::Error;

// ---

/// Transient refusals: the server is shedding load, the client may retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Backpressure {
    /// The target scheduler queue is at capacity.
    #[error("task queue full for priority {0}")]
    QueueFull(&'static str),

    /// Batch admission failed against the memory budget.
    #[error("batch memory exhausted: {0}")]
    MemoryExhausted(String),

    /// A circuit breaker is open toward a dependency.
    #[error("circuit open for {0}")]
    CircuitOpen(&'static str),

    /// The global weather rate limiter refused the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The database pool queue is over its pressure threshold.
    #[error("database pool saturated ({pending} pending)")]
    PoolSaturated { pending: usize },
}

impl Backpressure {
    /// HTTP status for this refusal: 429 for rate limiting, 503 otherwise.
    pub fn status(&self) -> StatusCode {
        // ---
        match self {
            Backpressure::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Failures on the durability path: database writes that must not be lost.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Backpressure(#[from] Backpressure),
}

/// Decode failures for inbound payloads. Returned synchronously as 400.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// None of the recognized formats matched.
    #[error("unrecognized payload ({raw_size} bytes, head {preview})")]
    Unrecognized { raw_size: usize, preview: String },

    /// Binary frame shorter than the fixed layout requires.
    #[error("binary frame too short: {0} bytes, need at least 18")]
    ShortFrame(usize),

    /// A fixed-layout field failed range validation.
    #[error("binary field out of range: {0}")]
    FieldRange(&'static str),

    /// Decompression of the binary envelope failed.
    #[error("binary envelope decompression failed: {0}")]
    Envelope(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Weather provider failure, recorded against that provider's breaker.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} timed out")]
    Timeout { provider: &'static str },

    #[error("{provider} returned unusable body: {detail}")]
    BadBody {
        provider: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Backpressure(#[from] Backpressure),
}

impl ProviderError {
    pub fn provider(&self) -> &'static str {
        // ---
        match self {
            ProviderError::Http { provider, .. }
            | ProviderError::Timeout { provider }
            | ProviderError::BadBody { provider, .. } => provider,
            ProviderError::Backpressure(_) => "breaker",
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn rate_limit_maps_to_429_everything_else_503() {
        // ---
        assert_eq!(
            Backpressure::RateLimited("rate_limit_exceeded".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Backpressure::QueueFull("critical").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Backpressure::CircuitOpen("db").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
