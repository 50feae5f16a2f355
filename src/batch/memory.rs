//! Batch admission control.
//!
//! Large offline batches are the one ingestion path that can blow the
//! process memory budget, so they pass a gate before any item is touched:
//! bounded concurrency, bounded total reserved megabytes, and a check
//! against what the process is actually using right now. The RSS reading
//! sits behind a probe trait so tests can dial pressure up and down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Backpressure;
use crate::pressure::PressureLevel;

/// Whole-process memory budget the batch path reasons against.
const SYSTEM_MEMORY_BUDGET_MB: f64 = 400.0;

// ---

/// Capability: read the process resident set size in megabytes.
pub trait MemoryProbe: Send + Sync {
    fn rss_mb(&self) -> f64;
}

/// Production probe reading `VmRSS` from `/proc/self/status`.
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn rss_mb(&self) -> f64 {
        // ---
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return 0.0;
        };
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: f64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0.0);
                return kb / 1024.0;
            }
        }
        0.0
    }
}

/// Fixed probe for tests and for platforms without procfs.
pub struct FixedProbe(pub Mutex<f64>);

impl FixedProbe {
    pub fn new(rss_mb: f64) -> Self {
        Self(Mutex::new(rss_mb))
    }

    pub fn set(&self, rss_mb: f64) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = rss_mb;
    }
}

impl MemoryProbe for FixedProbe {
    fn rss_mb(&self) -> f64 {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---

/// Tunables for the manager; memory-pressure thresholds are the
/// 220/280/350 MB defaults unless overridden.
#[derive(Debug, Clone)]
pub struct BatchMemoryConfig {
    pub max_concurrent_batches: usize,
    pub max_batch_memory_mb: f64,
    pub estimated_item_bytes: u64,
    pub memory_safety_margin_mb: f64,
    pub pressure_medium_mb: f64,
    pub pressure_high_mb: f64,
    pub pressure_critical_mb: f64,
}

impl Default for BatchMemoryConfig {
    fn default() -> Self {
        // ---
        Self {
            max_concurrent_batches: 2,
            max_batch_memory_mb: 120.0,
            estimated_item_bytes: 2048,
            memory_safety_margin_mb: 50.0,
            pressure_medium_mb: 220.0,
            pressure_high_mb: 280.0,
            pressure_critical_mb: 350.0,
        }
    }
}

#[derive(Debug)]
struct ActiveBatch {
    estimated_mb: f64,
    started: Instant,
    processed_items: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    active: HashMap<String, ActiveBatch>,
    total_mb: f64,
}

/// Admission controller for concurrent batches.
pub struct BatchMemoryManager {
    cfg: BatchMemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    ledger: Mutex<Ledger>,
}

impl BatchMemoryManager {
    pub fn new(cfg: BatchMemoryConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        // ---
        Self {
            cfg,
            probe,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Estimated memory for a batch of `items` items, in megabytes.
    pub fn estimate_mb(&self, items: usize) -> f64 {
        // ---
        (items as u64 * self.cfg.estimated_item_bytes) as f64 / (1024.0 * 1024.0)
    }

    /// Reserve memory for a batch. All checks happen under one lock so
    /// the reserved total always equals the sum over active batches.
    pub fn request(&self, batch_id: &str, estimated_mb: f64) -> Result<(), Backpressure> {
        // ---
        let mut ledger = self.lock();

        if ledger.active.len() >= self.cfg.max_concurrent_batches {
            return Err(Backpressure::MemoryExhausted(format!(
                "{} batches already active",
                ledger.active.len()
            )));
        }
        if ledger.total_mb + estimated_mb > self.cfg.max_batch_memory_mb {
            return Err(Backpressure::MemoryExhausted(format!(
                "would reserve {:.1} MB over the {:.0} MB budget",
                ledger.total_mb + estimated_mb,
                self.cfg.max_batch_memory_mb
            )));
        }
        let available =
            (SYSTEM_MEMORY_BUDGET_MB - self.probe.rss_mb() - self.cfg.memory_safety_margin_mb)
                .max(0.0);
        if estimated_mb > available {
            return Err(Backpressure::MemoryExhausted(format!(
                "need {estimated_mb:.1} MB, system has {available:.1} MB"
            )));
        }

        ledger.total_mb += estimated_mb;
        ledger.active.insert(
            batch_id.to_string(),
            ActiveBatch {
                estimated_mb,
                started: Instant::now(),
                processed_items: 0,
            },
        );
        debug!(
            "batch {batch_id} reserved {estimated_mb:.1} MB ({:.1} MB total)",
            ledger.total_mb
        );
        Ok(())
    }

    /// Release a batch reservation. Unknown ids are logged and ignored.
    pub fn release(&self, batch_id: &str) {
        // ---
        let mut ledger = self.lock();
        match ledger.active.remove(batch_id) {
            Some(batch) => {
                ledger.total_mb = (ledger.total_mb - batch.estimated_mb).max(0.0);
                debug!(
                    "batch {batch_id} released {:.1} MB after {:?} ({} items)",
                    batch.estimated_mb,
                    batch.started.elapsed(),
                    batch.processed_items
                );
            }
            None => warn!("release for unknown batch {batch_id}"),
        }
    }

    /// Advisory progress update for the health surface.
    pub fn update_progress(&self, batch_id: &str, processed_items: u64) {
        // ---
        if let Some(batch) = self.lock().active.get_mut(batch_id) {
            batch.processed_items = processed_items;
        }
    }

    /// Megabytes currently reserved across active batches.
    pub fn reserved_mb(&self) -> f64 {
        self.lock().total_mb
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Memory-pressure label from the probe's RSS reading.
    pub fn system_pressure(&self) -> PressureLevel {
        // ---
        let rss = self.probe.rss_mb();
        if rss > self.cfg.pressure_critical_mb {
            PressureLevel::Critical
        } else if rss > self.cfg.pressure_high_mb {
            PressureLevel::High
        } else if rss > self.cfg.pressure_medium_mb {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }

    /// Chunk size the stream processor should use at a pressure level.
    pub fn chunk_size_for(level: PressureLevel) -> usize {
        // ---
        match level {
            PressureLevel::Critical => 5,
            PressureLevel::High => 10,
            PressureLevel::Medium => 12,
            PressureLevel::Low => 15,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // ---
        match self.ledger.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---

/// Generate a batch id: `batch_<UTC-compact>_<hash4>`.
pub fn generate_batch_id() -> String {
    // ---
    let now = Utc::now();
    let compact = now.format("%Y%m%d%H%M%S");
    let mut hasher = Sha256::new();
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let digest = hasher.finalize();
    format!("batch_{compact}_{}", &hex::encode(&digest[..2]))
}
