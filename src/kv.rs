//! Redis-backed KV cache client.
//!
//! A thin read-through layer: every call is bounded by a one second
//! timeout and every failure degrades to a cache miss. Invalidation is
//! asynchronous through a bounded queue drained by a single worker so
//! ingestion hot paths never wait on cache bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use bb8_redis::{bb8, redis::AsyncCommands, RedisConnectionManager};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Deadline for any single Redis round trip.
const KV_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on queued invalidations; overflow is logged and dropped because
/// the next read simply refreshes the entry.
const INVALIDATION_QUEUE_SIZE: usize = 1000;

pub type RedisPool = bb8::Pool<RedisConnectionManager>;

// ---

/// One queued invalidation request.
#[derive(Debug, Clone)]
struct Invalidation {
    primary_key: String,
    device_id: Option<String>,
}

/// Shared KV client. Cloning shares the pool and the invalidation queue.
#[derive(Clone)]
pub struct KvClient {
    pool: RedisPool,
    invalidation_tx: mpsc::Sender<Invalidation>,
}

impl KvClient {
    /// Build the client and spawn its invalidation worker.
    pub fn new(pool: RedisPool) -> (Self, JoinHandle<()>) {
        // ---
        let (tx, rx) = mpsc::channel(INVALIDATION_QUEUE_SIZE);
        let worker = tokio::spawn(invalidation_worker(pool.clone(), rx));
        (
            Self {
                pool,
                invalidation_tx: tx,
            },
            worker,
        )
    }

    /// Direct access to the pool for callers that need scripting.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Read a JSON document. Any error or timeout is a miss.
    pub async fn get_json(&self, key: &str) -> Option<Value> {
        // ---
        let fetch = async {
            let mut conn = self.pool.get().await.ok()?;
            let raw: Option<String> = conn.get(key).await.ok()?;
            raw.and_then(|s| serde_json::from_str(&s).ok())
        };
        match tokio::time::timeout(KV_TIMEOUT, fetch).await {
            Ok(v) => v,
            Err(_) => {
                debug!("kv get timed out for {key}");
                None
            }
        }
    }

    /// Best-effort JSON write with a TTL.
    pub async fn set_json(&self, key: &str, value: &Value, ttl: Duration) {
        // ---
        let payload = value.to_string();
        let write = async {
            let mut conn = self.pool.get().await.ok()?;
            conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs())
                .await
                .ok()
        };
        if tokio::time::timeout(KV_TIMEOUT, write).await.is_err() {
            debug!("kv set timed out for {key}");
        }
    }

    /// Read all fields of a hash. Errors and timeouts yield an empty map.
    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        // ---
        let fetch = async {
            let mut conn = self.pool.get().await.ok()?;
            conn.hgetall::<_, HashMap<String, String>>(key).await.ok()
        };
        match tokio::time::timeout(KV_TIMEOUT, fetch).await {
            Ok(Some(map)) => map,
            _ => HashMap::new(),
        }
    }

    /// Best-effort multi-field hash write, refreshing the key TTL.
    pub async fn hset_fields(&self, key: &str, fields: &[(&str, String)], ttl: Duration) {
        // ---
        let key = key.to_string();
        let fields: Vec<(String, String)> =
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let write = async {
            let mut conn = self.pool.get().await.ok()?;
            conn.hset_multiple::<_, _, _, ()>(&key, &fields).await.ok()?;
            conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await.ok()
        };
        if tokio::time::timeout(KV_TIMEOUT, write).await.is_err() {
            debug!("kv hset timed out for {key}");
        }
    }

    /// Queue an invalidation. Fan-out happens in the worker; a full queue
    /// drops the request.
    pub fn invalidate(&self, primary_key: &str, device_id: Option<&str>) {
        // ---
        let req = Invalidation {
            primary_key: primary_key.to_string(),
            device_id: device_id.map(str::to_string),
        };
        if let Err(e) = self.invalidation_tx.try_send(req) {
            warn!("invalidation queue full, dropping {primary_key}: {e}");
        }
    }
}

// ---

/// Expand one invalidation into the full set of keys to delete.
///
/// Fan-out rules: the latest-data key also clears the stats summary and,
/// when a device is named, that device's raw-latest and history entries;
/// a device position key also clears that device's per-device rate key.
fn fan_out(req: &Invalidation) -> Vec<String> {
    // ---
    let mut keys = vec![req.primary_key.clone()];

    if req.primary_key == "latest_data" {
        keys.push("device_stats_summary".to_string());
        if let Some(id) = &req.device_id {
            keys.push(format!("latest_data_raw_{id}"));
            keys.push(format!("device_history_{id}"));
        }
    }

    if let Some(id) = req.primary_key.strip_prefix("device_position_") {
        keys.push(format!("weather_rate_{id}"));
    }

    keys
}

/// Single worker draining the invalidation queue. Runs until every
/// sender is dropped; failures are logged and skipped.
async fn invalidation_worker(pool: RedisPool, mut rx: mpsc::Receiver<Invalidation>) {
    // ---
    while let Some(req) = rx.recv().await {
        let keys = fan_out(&req);
        let delete = async {
            let mut conn = pool.get().await.ok()?;
            conn.del::<_, ()>(&keys).await.ok()
        };
        match tokio::time::timeout(KV_TIMEOUT, delete).await {
            Ok(Some(())) => debug!("invalidated {} keys for {}", keys.len(), req.primary_key),
            _ => warn!("invalidation failed for {}", req.primary_key),
        }
    }
    debug!("invalidation worker stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn latest_data_fans_out_to_device_keys() {
        // ---
        let keys = fan_out(&Invalidation {
            primary_key: "latest_data".into(),
            device_id: Some("d7".into()),
        });
        assert_eq!(
            keys,
            vec![
                "latest_data",
                "device_stats_summary",
                "latest_data_raw_d7",
                "device_history_d7"
            ]
        );
    }

    #[test]
    fn latest_data_without_device_only_clears_summary() {
        // ---
        let keys = fan_out(&Invalidation {
            primary_key: "latest_data".into(),
            device_id: None,
        });
        assert_eq!(keys, vec!["latest_data", "device_stats_summary"]);
    }

    #[test]
    fn position_key_clears_rate_key() {
        // ---
        let keys = fan_out(&Invalidation {
            primary_key: "device_position_d1".into(),
            device_id: None,
        });
        assert_eq!(keys, vec!["device_position_d1", "weather_rate_d1"]);
    }

    #[test]
    fn unrelated_key_has_no_fan_out() {
        // ---
        let keys = fan_out(&Invalidation {
            primary_key: "some_other_key".into(),
            device_id: Some("d1".into()),
        });
        assert_eq!(keys, vec!["some_other_key"]);
    }
}
