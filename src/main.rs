//! Application entry point for the `fleetsink` ingestion server.
//!
//! The binary owns the startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Connect the PostgreSQL pool and Redis pool, create the schema
//! - Construct the process-wide singletons (scheduler, batch memory
//!   manager, weather pipeline, stream and delta processors)
//! - Mount all API routes via the `routes` gateway and serve
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `REDIS_URL` (**required**) – Redis connection string
//! - `PORT` (optional) – HTTP listen port (default: 8080)
//! - `FLEETSINK_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `FLEETSINK_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! The remaining tunables are documented in [`fleetsink::config`].

use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use is_terminal::IsTerminal;

use anyhow::{Context, Result};
use bb8_redis::{bb8, RedisConnectionManager};
use dotenvy::dotenv;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use fleetsink::batch::delta::DeltaProcessor;
use fleetsink::batch::memory::ProcStatusProbe;
use fleetsink::batch::stream::StreamProcessor;
use fleetsink::batch::{BatchMemoryConfig, BatchMemoryManager};
use fleetsink::config;
use fleetsink::db::{create_schema, DbManager, PartitionManager, PoolConfig};
use fleetsink::kv::KvClient;
use fleetsink::routes;
use fleetsink::scheduler::{PriorityTaskManager, SchedulerConfig};
use fleetsink::weather::disk_cache::{StatvfsProbe, WeatherCacheConfig, WeatherDiskCache};
use fleetsink::weather::pipeline::WeatherPipeline;
use fleetsink::weather::position::{PositionConfig, PositionTracker};
use fleetsink::weather::providers::{ProviderConfig, WeatherProviders};
use fleetsink::weather::rate_limit::GlobalRateLimiter;
use fleetsink::weather::WeatherService;
use fleetsink::AppState;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = Arc::new(config::load_from_env()?);
    cfg.log_config();

    // Database: pool manager, schema, partition bookkeeping.
    let db = DbManager::connect(PoolConfig::from_config(&cfg))
        .await
        .context("failed to connect to database")?;
    create_schema(&db.pool().await).await?;
    let partitions = Arc::new(PartitionManager::new());
    tokio::spawn(db.clone().health_monitor());

    // Redis-backed KV client and its invalidation worker.
    let redis_mgr = RedisConnectionManager::new(cfg.redis_url.as_str())
        .context("invalid REDIS_URL")?;
    let redis_pool = bb8::Pool::builder()
        .build(redis_mgr)
        .await
        .context("failed to connect to redis")?;
    let (kv, _invalidation_worker) = KvClient::new(redis_pool);

    // Scheduler and batch admission.
    let scheduler = PriorityTaskManager::start(SchedulerConfig {
        queue_capacities: cfg.queue_capacities,
        queue_weights: cfg.queue_weights,
        worker_count: cfg.worker_count,
        task_age_limit: cfg.task_age_limit,
    });
    let memory = Arc::new(BatchMemoryManager::new(
        BatchMemoryConfig {
            max_concurrent_batches: cfg.max_concurrent_batches,
            max_batch_memory_mb: cfg.max_batch_memory_mb,
            estimated_item_bytes: cfg.estimated_item_bytes,
            memory_safety_margin_mb: cfg.memory_safety_margin_mb,
            ..BatchMemoryConfig::default()
        },
        Arc::new(ProcStatusProbe),
    ));

    // Weather stack: disk cache with its monitors, provider chain,
    // coordinator, position tracker, global limiter.
    let cache = Arc::new(WeatherDiskCache::new(
        WeatherCacheConfig {
            dir: PathBuf::from(&cfg.weather_cache_dir),
            ttl: cfg.weather_cache_ttl,
            distance_threshold_km: cfg.distance_threshold_km,
            max_files: cfg.max_cache_files,
            max_size_mb: cfg.max_cache_size_mb,
            ..WeatherCacheConfig::default()
        },
        Arc::new(StatvfsProbe),
    )?);
    tokio::spawn(cache.clone().disk_monitor());
    tokio::spawn(cleanup_loop(cache.clone()));

    let providers = Arc::new(WeatherProviders::new(ProviderConfig {
        openmeteo_url: cfg.openmeteo_url.clone(),
        openmeteo_marine_url: cfg.openmeteo_marine_url.clone(),
        wttr_url: cfg.wttr_url.clone(),
    }));
    let service = Arc::new(WeatherService::new(cache, providers));
    let tracker = PositionTracker::new(
        kv.clone(),
        PositionConfig {
            movement_threshold_km: cfg.movement_threshold_km,
            weather_expiration: cfg.weather_expiration,
            weather_cooldown: cfg.weather_cooldown,
        },
    );
    let limiter = GlobalRateLimiter::new(
        kv.clone(),
        cfg.weather_max_per_minute,
        cfg.weather_burst_limit,
    );
    let weather = Arc::new(WeatherPipeline::new(tracker, limiter, service));

    // Batch processors.
    let stream = Arc::new(StreamProcessor::new(
        db.clone(),
        partitions.clone(),
        memory.clone(),
        weather.clone(),
        kv.clone(),
        cfg.latest_write_mode,
        Vec::new(),
    ));
    let delta = Arc::new(DeltaProcessor::new(
        db.clone(),
        partitions.clone(),
        weather.clone(),
        kv.clone(),
    ));

    let state = AppState {
        config: cfg,
        db,
        partitions,
        kv,
        scheduler: scheduler.clone(),
        memory,
        weather,
        stream,
        delta,
    };
    let app = routes::router(state);

    let port: u16 = env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Draining scheduler");
    scheduler.shutdown().await;
    Ok(())
}

/// Periodic weather-cache maintenance; the cache itself rate-limits the
/// actual passes.
async fn cleanup_loop(cache: Arc<WeatherDiskCache>) {
    // ---
    let mut interval = tokio::time::interval(Duration::from_secs(30 * 60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        cache.intelligent_cleanup(false).await;
    }
}

async fn shutdown_signal() {
    // ---
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {e}");
    }
    tracing::info!("Shutdown signal received");
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// Color output follows TTY detection unless `FORCE_COLOR` overrides it;
/// span events are controlled by `FLEETSINK_SPAN_EVENTS` (`full`,
/// `enter_exit`, or the default CLOSE-only); the filter comes from
/// `RUST_LOG` when set, else `FLEETSINK_LOG_LEVEL`.
fn init_tracing() {
    // ---
    let span_events = match env::var("FLEETSINK_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("FLEETSINK_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
