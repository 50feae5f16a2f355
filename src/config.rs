//! Configuration loader for the `fleetsink` ingestion server.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). By consolidating configuration logic
//! here, we avoid scattering `env::var` calls throughout the codebase.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional u64 environment variable with a default value.
macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional float environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

// ---

/// How the latest-state upsert treats the incoming payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestWriteMode {
    /// Recursive merge over the stored document (telemetry path default).
    Merge,
    /// Full replacement of the stored document (delta path default).
    Replace,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Redis connection string for the KV cache layer.
    pub redis_url: String,

    /// DB pool sizing.
    pub pool_min_size: u32,
    pub pool_max_size: u32,

    /// Pending-acquire count beyond which general acquisitions fail fast.
    pub pool_queue_threshold: usize,

    /// Concurrent acquisitions reserved for critical writes.
    pub critical_pool_size: usize,

    /// Per-operation deadlines.
    pub connection_timeout: Duration,
    pub query_timeout: Duration,
    pub queue_timeout: Duration,

    /// Pool health probing.
    pub health_check_interval: Duration,
    pub max_connection_failures: u32,

    /// Batch admission.
    pub max_concurrent_batches: usize,
    pub max_batch_memory_mb: f64,
    pub estimated_item_bytes: u64,
    pub memory_safety_margin_mb: f64,

    /// Weather rate limits (global, per minute).
    pub weather_max_per_minute: u32,
    pub weather_burst_limit: u32,

    /// Weather disk cache.
    pub weather_cache_dir: String,
    pub weather_cache_ttl: Duration,
    pub distance_threshold_km: f64,
    pub max_cache_files: usize,
    pub max_cache_size_mb: u64,

    /// Position tracker.
    pub movement_threshold_km: f64,
    pub weather_expiration: Duration,
    pub weather_cooldown: Duration,

    /// Weather provider endpoints.
    pub openmeteo_url: String,
    pub openmeteo_marine_url: String,
    pub wttr_url: String,

    /// Scheduler shape, indexed by priority (critical..low).
    pub queue_capacities: [usize; 4],
    pub queue_weights: [f64; 4],
    pub worker_count: usize,
    pub task_age_limit: Duration,

    /// Latest-state write mode for the telemetry path. The delta path
    /// always uses full replacement.
    pub latest_write_mode: LatestWriteMode,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
/// - `REDIS_URL` – Redis connection string
///
/// Everything else is optional with the documented defaults.
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let redis_url = require_env!("REDIS_URL");

    let latest_write_mode = match env::var("LATEST_WRITE_MODE").ok().as_deref() {
        Some("merge") | None => LatestWriteMode::Merge,
        Some("replace") => LatestWriteMode::Replace,
        Some(other) => return Err(anyhow!("Invalid LATEST_WRITE_MODE: {other}")),
    };

    Ok(Config {
        db_url,
        redis_url,
        pool_min_size: parse_env_u32!("POOL_MIN_SIZE", 2),
        pool_max_size: parse_env_u32!("POOL_MAX_SIZE", 10),
        pool_queue_threshold: parse_env_u32!("POOL_QUEUE_THRESHOLD", 8) as usize,
        critical_pool_size: parse_env_u32!("CRITICAL_POOL_SIZE", 3) as usize,
        connection_timeout: Duration::from_secs(parse_env_u64!("CONNECTION_TIMEOUT_S", 10)),
        query_timeout: Duration::from_secs(parse_env_u64!("QUERY_TIMEOUT_S", 10)),
        queue_timeout: Duration::from_secs(parse_env_u64!("QUEUE_TIMEOUT_S", 5)),
        health_check_interval: Duration::from_secs(parse_env_u64!("HEALTH_CHECK_INTERVAL_S", 30)),
        max_connection_failures: parse_env_u32!("MAX_CONNECTION_FAILURES", 3),
        max_concurrent_batches: parse_env_u32!("MAX_CONCURRENT_BATCHES", 2) as usize,
        max_batch_memory_mb: parse_env_f64!("MAX_BATCH_MEMORY_MB", 120.0),
        estimated_item_bytes: parse_env_u64!("ESTIMATED_ITEM_SIZE_BYTES", 2048),
        memory_safety_margin_mb: parse_env_f64!("MEMORY_SAFETY_MARGIN_MB", 50.0),
        weather_max_per_minute: parse_env_u32!("WEATHER_MAX_PER_MINUTE", 8),
        weather_burst_limit: parse_env_u32!("WEATHER_BURST_LIMIT", 12),
        weather_cache_dir: env::var("WEATHER_CACHE_DIR")
            .unwrap_or_else(|_| "/tmp/fleetsink_weather_cache".to_string()),
        weather_cache_ttl: Duration::from_secs(parse_env_u64!("WEATHER_CACHE_DURATION_S", 3600)),
        distance_threshold_km: parse_env_f64!("DISTANCE_THRESHOLD_KM", 1.0),
        max_cache_files: parse_env_u32!("MAX_CACHE_FILES", 1000) as usize,
        max_cache_size_mb: parse_env_u64!("MAX_CACHE_SIZE_MB", 50),
        movement_threshold_km: parse_env_f64!("MOVEMENT_THRESHOLD_KM", 1.0),
        weather_expiration: Duration::from_secs(parse_env_u64!("WEATHER_EXPIRATION_S", 3600)),
        weather_cooldown: Duration::from_secs(parse_env_u64!("WEATHER_COOLDOWN_S", 30)),
        openmeteo_url: env::var("OPENMETEO_URL")
            .unwrap_or_else(|_| "https://api.open-meteo.com/v1/forecast".to_string()),
        openmeteo_marine_url: env::var("OPENMETEO_MARINE_URL")
            .unwrap_or_else(|_| "https://marine-api.open-meteo.com/v1/marine".to_string()),
        wttr_url: env::var("WTTR_URL").unwrap_or_else(|_| "https://wttr.in".to_string()),
        queue_capacities: [
            parse_env_u32!("QUEUE_CAP_CRITICAL", 15) as usize,
            parse_env_u32!("QUEUE_CAP_HIGH", 12) as usize,
            parse_env_u32!("QUEUE_CAP_NORMAL", 8) as usize,
            parse_env_u32!("QUEUE_CAP_LOW", 5) as usize,
        ],
        queue_weights: [
            parse_env_f64!("QUEUE_WEIGHT_CRITICAL", 0.60),
            parse_env_f64!("QUEUE_WEIGHT_HIGH", 0.25),
            parse_env_f64!("QUEUE_WEIGHT_NORMAL", 0.10),
            parse_env_f64!("QUEUE_WEIGHT_LOW", 0.05),
        ],
        worker_count: parse_env_u32!("WORKER_COUNT", 3) as usize,
        task_age_limit: Duration::from_secs(parse_env_u64!("TASK_AGE_LIMIT_S", 45)),
        latest_write_mode,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL : {}", mask_url(&self.db_url));
        tracing::info!("  REDIS_URL    : {}", mask_url(&self.redis_url));
        tracing::info!(
            "  POOL         : {}..{} (critical {}, queue threshold {})",
            self.pool_min_size,
            self.pool_max_size,
            self.critical_pool_size,
            self.pool_queue_threshold
        );
        tracing::info!(
            "  BATCH        : {} concurrent, {} MB, {} B/item",
            self.max_concurrent_batches,
            self.max_batch_memory_mb,
            self.estimated_item_bytes
        );
        tracing::info!(
            "  WEATHER      : {}/min burst {}, cache {} ({} files, {} MB)",
            self.weather_max_per_minute,
            self.weather_burst_limit,
            self.weather_cache_dir,
            self.max_cache_files,
            self.max_cache_size_mb
        );
        tracing::info!(
            "  SCHEDULER    : {} workers, caps {:?}, weights {:?}, age limit {:?}",
            self.worker_count,
            self.queue_capacities,
            self.queue_weights,
            self.task_age_limit
        );
    }
}

/// Mask the password component of a connection URL.
fn mask_url(url: &str) -> String {
    // ---
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn mask_hides_password() {
        // ---
        assert_eq!(
            mask_url("postgres://app:hunter2@db:5432/fleet"),
            "postgres://app:****@db:5432/fleet"
        );
        assert_eq!(mask_url("redis://localhost"), "redis://localhost");
    }
}
