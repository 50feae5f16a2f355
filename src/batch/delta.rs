//! Delta batch processor.
//!
//! A delta is a partial sample that only makes sense replayed over the
//! device's current state. The processor serializes work per device
//! through a small keyed-mutex map, keeps a short-lived base-state cache
//! so a run of deltas for one device loads the database once, and
//! commits each reconstructed payload atomically (history row plus full
//! latest-state replacement).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::db::{self, DbManager, PartitionManager, TimestampedRecord};
use crate::kv::KvClient;
use crate::merge::deep_merge;
use crate::timestamp;
use crate::validate::has_usable_coordinates;
use crate::weather::pipeline::WeatherPipeline;

/// Fraction of deltas allowed to arrive without a device id.
const MAX_MISSING_ID_RATE: f64 = 0.10;

/// Per-delta enrichment deadline.
const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Progress event cadence.
const PROGRESS_EVERY: u64 = 5;

const ID_ALIASES: &[&str] = &["id", "device_id", "deviceId", "device", "dev_id"];

// ---

/// Bounded per-device lock map; inserting past the bound evicts the
/// least recently used entry. Holders of an evicted lock keep it alive
/// through their own `Arc`, so eviction never breaks serialization for
/// an in-flight delta, only for a future one.
pub struct DeviceLocks {
    bound: usize,
    map: std::sync::Mutex<HashMap<String, (Arc<tokio::sync::Mutex<()>>, Instant)>>,
}

impl DeviceLocks {
    pub fn new(bound: usize) -> Self {
        // ---
        Self {
            bound,
            map: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_for(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        // ---
        let mut map = match self.map.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((lock, used)) = map.get_mut(device_id) {
            *used = Instant::now();
            return lock.clone();
        }
        if map.len() >= self.bound {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        map.insert(device_id.to_string(), (lock.clone(), Instant::now()));
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

/// Per-device base-state cache with a fixed TTL.
pub struct BaseStateCache {
    ttl: Duration,
    map: std::sync::Mutex<HashMap<String, (Value, Instant)>>,
}

impl BaseStateCache {
    pub fn new(ttl: Duration) -> Self {
        // ---
        Self {
            ttl,
            map: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Value> {
        // ---
        let mut map = match self.map.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let expired = match map.get(device_id) {
            Some((value, stored)) => {
                if stored.elapsed() <= self.ttl {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            map.remove(device_id);
        }
        None
    }

    pub fn put(&self, device_id: &str, value: Value) {
        // ---
        let mut map = match self.map.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(device_id.to_string(), (value, Instant::now()));
    }
}

// ---

pub struct DeltaProcessor {
    db: Arc<DbManager>,
    partitions: Arc<PartitionManager>,
    weather: Arc<WeatherPipeline>,
    kv: KvClient,
    locks: DeviceLocks,
    base_cache: BaseStateCache,
}

impl DeltaProcessor {
    pub fn new(
        db: Arc<DbManager>,
        partitions: Arc<PartitionManager>,
        weather: Arc<WeatherPipeline>,
        kv: KvClient,
    ) -> Self {
        // ---
        Self {
            db,
            partitions,
            weather,
            kv,
            locks: DeviceLocks::new(20),
            base_cache: BaseStateCache::new(Duration::from_secs(300)),
        }
    }

    /// Process a delta batch, returning the event stream.
    pub fn process(
        self: Arc<Self>,
        deltas: Vec<Value>,
        source_ip: String,
        user_agent: String,
        batch_id: String,
    ) -> ReceiverStream<Value> {
        // ---
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            self.run(deltas, source_ip, user_agent, batch_id, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run(
        &self,
        mut deltas: Vec<Value>,
        source_ip: String,
        user_agent: String,
        batch_id: String,
        tx: mpsc::Sender<Value>,
    ) {
        // ---
        let total = deltas.len();
        let missing = deltas.iter().filter(|d| explicit_id(d).is_none()).count();
        if total > 0 && missing as f64 / total as f64 > MAX_MISSING_ID_RATE {
            let _ = tx
                .send(json!({
                    "event": "error",
                    "error": "missing_device_ids",
                    "missing": missing,
                    "total": total,
                }))
                .await;
            return;
        }

        sort_chronologically(&mut deltas);

        let mut processed: u64 = 0;
        let mut errors: u64 = 0;
        for delta in deltas {
            let Some(device_id) = explicit_id(&delta) else {
                errors += 1;
                continue;
            };

            match self
                .apply_delta(&device_id, delta, &source_ip, &user_agent, &batch_id)
                .await
            {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!("delta for {device_id} failed: {e}");
                    errors += 1;
                }
            }

            let handled = processed + errors;
            if handled > 0 && handled % PROGRESS_EVERY == 0 {
                let _ = tx
                    .send(json!({
                        "event": "progress",
                        "processed": processed,
                        "errors": errors,
                        "total": total,
                    }))
                    .await;
            }
        }

        debug!("delta batch {batch_id} completed: {processed} processed, {errors} errors");
        let _ = tx
            .send(json!({
                "event": "completed",
                "batch_id": batch_id,
                "processed": processed,
                "errors": errors,
            }))
            .await;
    }

    /// Replay one delta over the device's base state and commit.
    async fn apply_delta(
        &self,
        device_id: &str,
        delta: Value,
        source_ip: &str,
        user_agent: &str,
        batch_id: &str,
    ) -> Result<(), crate::error::StorageError> {
        // ---
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let base = match self.base_cache.get(device_id) {
            Some(base) => base,
            None => {
                let id = device_id.to_string();
                self.db
                    .safe_db_operation(false, move |pool| {
                        let id = id.clone();
                        async move { db::get_latest(&pool, &id).await }
                    })
                    .await?
                    .unwrap_or_else(|| json!({}))
            }
        };

        let mut merged = deep_merge(&base, &delta);
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("batch_id".to_string(), json!(batch_id));
            obj.insert("source_ip".to_string(), json!(source_ip));
            obj.insert("user_agent".to_string(), json!(user_agent));
            obj.insert("data_type".to_string(), json!("delta"));
        }

        if has_usable_coordinates(&merged) {
            let enrich = self.weather.enrich(device_id, &mut merged);
            if tokio::time::timeout(ENRICHMENT_TIMEOUT, enrich).await.is_err() {
                debug!("delta enrichment timed out for {device_id}");
            }
        }

        let ts = delta
            .get("ts")
            .and_then(timestamp::parse_value)
            .unwrap_or_else(Utc::now);

        let rec = TimestampedRecord {
            device_id: device_id.to_string(),
            payload: delta.clone(),
            data_timestamp: ts,
            data_type: "delta",
            is_offline: false,
            batch_id: Some(batch_id.to_string()),
        };
        let partitions = self.partitions.clone();
        let latest = merged.clone();
        self.db
            .safe_db_operation(false, move |pool| {
                let rec = rec.clone();
                let latest = latest.clone();
                let partitions = partitions.clone();
                async move {
                    partitions.ensure_partition(&pool, rec.data_timestamp).await?;
                    db::commit_delta(&pool, &rec, &latest).await?;
                    Ok(())
                }
            })
            .await?;

        self.base_cache.put(device_id, merged);
        self.kv.invalidate("latest_data", Some(device_id));
        Ok(())
    }
}

// ---

/// The explicit device id, if the delta carries one. Deltas never fall
/// back to fingerprinting; without an id there is no base state to
/// replay against.
fn explicit_id(delta: &Value) -> Option<String> {
    // ---
    ID_ALIASES.iter().find_map(|k| {
        delta
            .get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.chars().take(100).collect())
    })
}

/// Order by `(device_id, ts)` so each device sees its deltas in
/// chronological order regardless of arrival interleaving.
fn sort_chronologically(deltas: &mut [Value]) {
    // ---
    deltas.sort_by(|a, b| {
        let ka = (explicit_id(a).unwrap_or_default(), ts_of(a));
        let kb = (explicit_id(b).unwrap_or_default(), ts_of(b));
        ka.cmp(&kb)
    });
}

/// Sort key in epoch milliseconds, accepting every shape the stored
/// record does (numeric epoch, numeric string, ISO-8601).
fn ts_of(delta: &Value) -> i64 {
    // ---
    delta
        .get("ts")
        .and_then(timestamp::parse_value)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn explicit_id_accepts_aliases_but_not_absence() {
        // ---
        assert_eq!(explicit_id(&json!({"deviceId": "d1"})), Some("d1".into()));
        assert_eq!(explicit_id(&json!({"dev_id": " d2 "})), Some("d2".into()));
        assert_eq!(explicit_id(&json!({"perc": 10})), None);
        assert_eq!(explicit_id(&json!({"id": "  "})), None);
    }

    #[test]
    fn sort_orders_by_device_then_time() {
        // ---
        let mut deltas = vec![
            json!({"id": "b", "ts": 5}),
            json!({"id": "a", "ts": 9}),
            json!({"id": "a", "ts": 2}),
            json!({"id": "b", "ts": 1}),
        ];
        sort_chronologically(&mut deltas);
        let order: Vec<(String, i64)> = deltas
            .iter()
            .map(|d| (explicit_id(d).unwrap(), ts_of(d)))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".into(), 2_000),
                ("a".into(), 9_000),
                ("b".into(), 1_000),
                ("b".into(), 5_000)
            ]
        );
    }

    #[test]
    fn iso_timestamps_sort_against_numeric_ones() {
        // ---
        let mut deltas = vec![
            json!({"id": "a", "ts": "2023-11-14T22:13:25+00:00"}),
            json!({"id": "a", "ts": 1_700_000_000}),
        ];
        sort_chronologically(&mut deltas);
        assert_eq!(deltas[0]["ts"], json!(1_700_000_000));
        assert_eq!(ts_of(&deltas[1]), 1_700_000_005_000);
    }

    #[test]
    fn device_locks_evict_least_recently_used() {
        // ---
        let locks = DeviceLocks::new(3);
        let _a = locks.lock_for("a");
        std::thread::sleep(Duration::from_millis(2));
        let _b = locks.lock_for("b");
        std::thread::sleep(Duration::from_millis(2));
        let _c = locks.lock_for("c");
        std::thread::sleep(Duration::from_millis(2));

        // Touch "a" so "b" is now the oldest.
        let _a2 = locks.lock_for("a");
        let _d = locks.lock_for("d");
        assert_eq!(locks.len(), 3);

        // "b" was evicted: a fresh request makes a new lock instance.
        let b_again = locks.lock_for("b");
        assert_eq!(Arc::strong_count(&b_again), 2);
    }

    #[test]
    fn same_device_shares_one_lock() {
        // ---
        let locks = DeviceLocks::new(20);
        let l1 = locks.lock_for("d1");
        let l2 = locks.lock_for("d1");
        assert!(Arc::ptr_eq(&l1, &l2));
    }

    #[test]
    fn base_cache_expires() {
        // ---
        let cache = BaseStateCache::new(Duration::from_millis(20));
        cache.put("d1", json!({"perc": 10}));
        assert_eq!(cache.get("d1"), Some(json!({"perc": 10})));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("d1"), None);
    }
}
