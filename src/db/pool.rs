//! Connection pool manager with priority acquisition.
//!
//! The pool is the only shared database handle in the process. Every
//! operation goes through [`DbManager::safe_db_operation`] so the circuit
//! breaker sees each failure, queue pressure is enforced before a
//! connection is ever requested, and critical writes keep a reserved
//! concurrency slice that bulk traffic cannot exhaust.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{Backpressure, StorageError};

/// Recovery window for the pool breaker once it opens.
const CIRCUIT_BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Pressure above which even critical acquisitions are refused.
const CRITICAL_PRESSURE_CUTOFF: f64 = 0.8;

// ---

/// Shared database manager.
pub struct DbManager {
    pool: RwLock<PgPool>,
    breaker: CircuitBreaker,
    /// Reserved concurrency for critical writes.
    critical_slots: Semaphore,
    /// Acquisitions currently waiting on or holding a connection.
    pending: AtomicUsize,
    /// Consecutive health-probe failures.
    probe_failures: AtomicU32,
    cfg: PoolConfig,
}

/// The subset of [`Config`] the pool needs, copied so the manager owns it.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub min_size: u32,
    pub max_size: u32,
    pub queue_threshold: usize,
    pub critical_pool_size: usize,
    pub connection_timeout: Duration,
    pub query_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_connection_failures: u32,
}

impl PoolConfig {
    pub fn from_config(cfg: &Config) -> Self {
        // ---
        Self {
            db_url: cfg.db_url.clone(),
            min_size: cfg.pool_min_size,
            max_size: cfg.pool_max_size,
            queue_threshold: cfg.pool_queue_threshold,
            critical_pool_size: cfg.critical_pool_size,
            connection_timeout: cfg.connection_timeout,
            query_timeout: cfg.query_timeout,
            health_check_interval: cfg.health_check_interval,
            max_connection_failures: cfg.max_connection_failures,
        }
    }
}

impl DbManager {
    /// Connect the initial pool.
    pub async fn connect(cfg: PoolConfig) -> Result<Arc<Self>, sqlx::Error> {
        // ---
        let pool = build_pool(&cfg).await?;
        info!("database pool connected ({}..{})", cfg.min_size, cfg.max_size);
        Ok(Arc::new(Self {
            pool: RwLock::new(pool),
            breaker: CircuitBreaker::new("db", 2, CIRCUIT_BREAKER_TIMEOUT, 1),
            critical_slots: Semaphore::new(cfg.critical_pool_size),
            pending: AtomicUsize::new(0),
            probe_failures: AtomicU32::new(0),
            cfg,
        }))
    }

    /// Current pool handle. Cheap clone; sqlx pools are internally shared.
    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Pending acquisitions relative to the fail-fast threshold.
    pub fn queue_pressure(&self) -> f64 {
        // ---
        let pending = self.pending.load(Ordering::Relaxed);
        pending as f64 / self.cfg.queue_threshold.max(1) as f64
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state().as_str()
    }

    /// Run a database operation under the pool's protection.
    ///
    /// The closure receives a pool clone and may be invoked twice: a
    /// critical operation that times out is retried once. Flow:
    /// breaker gate, priority admission, per-op deadline
    /// (`query_timeout`, doubled for critical), breaker bookkeeping.
    pub async fn safe_db_operation<T, F, Fut>(
        &self,
        critical: bool,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        // ---
        self.breaker.check()?;

        let _permit = if critical {
            match self.critical_slots.try_acquire() {
                Ok(p) => Some(p),
                Err(_) => {
                    if self.queue_pressure() > CRITICAL_PRESSURE_CUTOFF {
                        return Err(Backpressure::PoolSaturated {
                            pending: self.pending.load(Ordering::Relaxed),
                        }
                        .into());
                    }
                    // Slots busy but the pool itself is calm: wait our turn.
                    Some(self.critical_slots.acquire().await.map_err(|_| {
                        Backpressure::CircuitOpen("db")
                    })?)
                }
            }
        } else {
            let pending = self.pending.load(Ordering::Relaxed);
            if pending > self.cfg.queue_threshold {
                return Err(Backpressure::PoolSaturated { pending }.into());
            }
            None
        };

        let timeout = if critical {
            self.cfg.query_timeout * 2
        } else {
            // General work gets less patience as the queue builds up.
            let scale = (1.0 - self.queue_pressure() * 0.5).max(0.25);
            self.cfg.query_timeout.mul_f64(scale)
        };

        self.pending.fetch_add(1, Ordering::Relaxed);
        let result = self.run_once(&op, timeout).await;
        let result = match result {
            Err(StorageError::Timeout(_)) if critical => {
                warn!("critical db operation timed out, retrying once");
                self.run_once(&op, timeout).await
            }
            other => other,
        };
        self.pending.fetch_sub(1, Ordering::Relaxed);

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(StorageError::Backpressure(_)) => {}
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn run_once<T, F, Fut>(&self, op: &F, timeout: Duration) -> Result<T, StorageError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        // ---
        let pool = self.pool.read().await.clone();
        match tokio::time::timeout(timeout, op(pool)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StorageError::Db(e)),
            Err(_) => Err(StorageError::Timeout(timeout)),
        }
    }

    /// Health-probe loop. Runs until the process shuts down: probes
    /// `SELECT 1` each interval and rebuilds the pool with exponential
    /// backoff after repeated failures.
    pub async fn health_monitor(self: Arc<Self>) {
        // ---
        let mut interval = tokio::time::interval(self.cfg.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.probe().await {
                self.probe_failures.store(0, Ordering::Relaxed);
                self.breaker.record_success();
                continue;
            }

            let failures = self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
            self.breaker.record_failure();
            warn!("database health probe failed ({failures} consecutive)");

            if failures >= self.cfg.max_connection_failures {
                self.rebuild_pool().await;
            }
        }
    }

    async fn probe(&self) -> bool {
        // ---
        let pool = self.pool.read().await.clone();
        tokio::time::timeout(
            self.cfg.connection_timeout,
            sqlx::query("SELECT 1").execute(&pool),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    /// Tear down and reconnect, backing off exponentially until a new
    /// pool answers the probe.
    async fn rebuild_pool(&self) {
        // ---
        warn!("rebuilding database pool");
        let mut backoff = Duration::from_secs(1);
        loop {
            match build_pool(&self.cfg).await {
                Ok(new_pool) => {
                    let old = {
                        let mut guard = self.pool.write().await;
                        std::mem::replace(&mut *guard, new_pool)
                    };
                    old.close().await;
                    self.probe_failures.store(0, Ordering::Relaxed);
                    info!("database pool rebuilt");
                    return;
                }
                Err(e) => {
                    error!("pool rebuild failed: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}

async fn build_pool(cfg: &PoolConfig) -> Result<PgPool, sqlx::Error> {
    // ---
    PgPoolOptions::new()
        .min_connections(cfg.min_size)
        .max_connections(cfg.max_size)
        .acquire_timeout(cfg.connection_timeout)
        .connect(&cfg.db_url)
        .await
}
