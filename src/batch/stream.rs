//! Chunked batch ingestion with progress streaming.
//!
//! A batch is an array of offline-buffered samples, possibly carrying
//! compressed-timestamp markers: an item with `bts` opens an offline
//! session at that base timestamp, and following items place themselves
//! with a `tso` seconds offset. Processing is chunked, the chunk size
//! re-read from memory pressure as the batch progresses, and every
//! stage of the run is reported as JSON events on the returned stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::LatestWriteMode;
use crate::db::{self, DbManager, PartitionManager, TimestampedRecord};
use crate::kv::KvClient;
use crate::merge::{merge_missing, resolve_device_id};
use crate::pressure::PressureLevel;
use crate::timestamp;
use crate::validate::has_usable_coordinates;
use crate::weather::pipeline::WeatherPipeline;

use super::{BatchMemoryManager, BatchReservation, ScratchRelease};

/// Per-item enrichment deadline inside a batch.
const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Items counted before the error-rate abort applies.
const ERROR_RATE_FLOOR: u64 = 10;

/// Fraction of failed items that aborts the batch.
const MAX_ERROR_RATE: f64 = 0.15;

/// Keys the server stamps onto items; their presence alone does not make
/// a session marker into a data sample.
const ENVELOPE_KEYS: &[&str] = &["bts", "source_ip", "user_agent", "batch_id"];

// ---

pub struct StreamProcessor {
    db: Arc<DbManager>,
    partitions: Arc<PartitionManager>,
    memory: Arc<BatchMemoryManager>,
    weather: Arc<WeatherPipeline>,
    kv: KvClient,
    write_mode: LatestWriteMode,
    scratch: Vec<Arc<dyn ScratchRelease>>,
}

impl StreamProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbManager>,
        partitions: Arc<PartitionManager>,
        memory: Arc<BatchMemoryManager>,
        weather: Arc<WeatherPipeline>,
        kv: KvClient,
        write_mode: LatestWriteMode,
        scratch: Vec<Arc<dyn ScratchRelease>>,
    ) -> Self {
        // ---
        Self {
            db,
            partitions,
            memory,
            weather,
            kv,
            write_mode,
            scratch,
        }
    }

    /// Process a batch, returning the event stream. The heavy work runs
    /// on a spawned task so the HTTP handler can start streaming
    /// immediately; dropping the stream cancels the run at the next send.
    pub fn process(
        self: Arc<Self>,
        items: Vec<Value>,
        source_ip: String,
        user_agent: String,
        batch_id: String,
    ) -> ReceiverStream<Value> {
        // ---
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            self.run(items, source_ip, user_agent, batch_id, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run(
        &self,
        items: Vec<Value>,
        source_ip: String,
        user_agent: String,
        batch_id: String,
        tx: mpsc::Sender<Value>,
    ) {
        // ---
        let total = items.len();
        let estimated_mb = self.memory.estimate_mb(total);

        let _reservation =
            match BatchReservation::acquire(self.memory.clone(), &batch_id, estimated_mb) {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx
                        .send(json!({"event": "error", "error": "admission_refused", "detail": e.to_string()}))
                        .await;
                    return;
                }
            };

        let mut pressure = self.memory.system_pressure();
        let mut chunk_size = BatchMemoryManager::chunk_size_for(pressure);
        if tx
            .send(json!({
                "event": "started",
                "batch_id": &batch_id,
                "total_items": total,
                "estimated_memory_mb": estimated_mb,
                "chunk_size": chunk_size,
            }))
            .await
            .is_err()
        {
            return;
        }

        let mut base_ts: Option<DateTime<Utc>> = None;
        let mut processed: u64 = 0;
        let mut errors: u64 = 0;

        for (idx, mut item) in items.into_iter().enumerate() {
            // Pressure re-check; the cadence tracks the current chunk size.
            if idx > 0 && idx % (chunk_size * 3) == 0 {
                let now_pressure = self.memory.system_pressure();
                if now_pressure != pressure {
                    pressure = now_pressure;
                    chunk_size = BatchMemoryManager::chunk_size_for(pressure);
                    let _ = tx
                        .send(json!({
                            "event": "chunk_size_adjusted",
                            "pressure": pressure.as_str(),
                            "chunk_size": chunk_size,
                        }))
                        .await;
                    if pressure == PressureLevel::Critical {
                        for s in &self.scratch {
                            s.release_scratch();
                        }
                    }
                }
            }

            let Some(obj) = item.as_object_mut() else {
                errors += 1;
                continue;
            };
            merge_missing(
                obj,
                &[
                    ("source_ip", json!(source_ip.as_str())),
                    ("user_agent", json!(user_agent.as_str())),
                    ("batch_id", json!(batch_id.as_str())),
                ],
            );

            let mut bts_ts = None;
            if let Some(b) = obj.get("bts").and_then(timestamp::parse_value) {
                base_ts = Some(b);
                bts_ts = Some(b);
                let _ = tx
                    .send(json!({
                        "event": "new_offline_session",
                        "base_timestamp": b.to_rfc3339(),
                    }))
                    .await;
                if is_session_marker(obj) {
                    continue;
                }
            }

            let actual_ts = actual_timestamp(&item, base_ts, bts_ts);
            match self.persist(&item, actual_ts, &batch_id, &source_ip).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!("batch {batch_id} item {idx} failed: {e}");
                    errors += 1;
                }
            }

            if (idx + 1) % chunk_size == 0 {
                self.memory.update_progress(&batch_id, processed);
                let _ = tx
                    .send(json!({
                        "event": "processed",
                        "processed": processed,
                        "errors": errors,
                        "total_items": total,
                    }))
                    .await;

                let done = processed + errors;
                if done >= ERROR_RATE_FLOOR && errors as f64 / done as f64 > MAX_ERROR_RATE {
                    let _ = tx
                        .send(json!({
                            "event": "error",
                            "error": "error_rate_exceeded",
                            "processed": processed,
                            "errors": errors,
                        }))
                        .await;
                    return;
                }
            }
        }

        debug!("batch {batch_id} completed: {processed} processed, {errors} errors");
        let _ = tx
            .send(json!({
                "event": "completed",
                "batch_id": batch_id,
                "processed": processed,
                "errors": errors,
            }))
            .await;
    }

    /// Land one sample: enrich when it carries coordinates, then write
    /// the history row and the latest state in one pool operation.
    async fn persist(
        &self,
        item: &Value,
        ts: DateTime<Utc>,
        batch_id: &str,
        source_ip: &str,
    ) -> Result<(), crate::error::StorageError> {
        // ---
        let device_id = resolve_device_id(item, source_ip);
        let mut sample = item.clone();
        if has_usable_coordinates(&sample) {
            let enrich = self.weather.enrich(&device_id, &mut sample);
            if tokio::time::timeout(ENRICHMENT_TIMEOUT, enrich).await.is_err() {
                debug!("enrichment timed out for {device_id}");
            }
        }

        let rec = TimestampedRecord {
            device_id: device_id.clone(),
            payload: sample.clone(),
            data_timestamp: ts,
            data_type: "telemetry",
            is_offline: true,
            batch_id: Some(batch_id.to_string()),
        };
        let partitions = self.partitions.clone();
        let mode = self.write_mode;
        let db_device_id = device_id.clone();

        self.db
            .safe_db_operation(false, move |pool| {
                let rec = rec.clone();
                let sample = sample.clone();
                let device_id = db_device_id.clone();
                let partitions = partitions.clone();
                async move {
                    partitions.ensure_partition(&pool, rec.data_timestamp).await?;
                    db::insert_timestamped(&pool, &rec).await?;
                    db::upsert_latest(&pool, &device_id, &sample, mode).await?;
                    Ok(())
                }
            })
            .await?;

        self.kv.invalidate("latest_data", Some(&device_id));
        Ok(())
    }
}

// ---

/// A session marker carries `bts` and envelope fields but no telemetry.
fn is_session_marker(obj: &Map<String, Value>) -> bool {
    obj.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str()))
}

/// Timestamp placement for one batch item.
///
/// An item that set the base gets exactly the base; otherwise a `tso`
/// offset against the current base wins, then any plain timestamp field,
/// then the server clock.
fn actual_timestamp(
    item: &Value,
    base: Option<DateTime<Utc>>,
    bts_ts: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    // ---
    if let Some(ts) = bts_ts {
        return ts;
    }
    if let (Some(base), Some(offset)) = (base, item.get("tso").and_then(Value::as_f64)) {
        if offset.is_finite() {
            return base + chrono::Duration::milliseconds((offset * 1000.0) as i64);
        }
    }
    timestamp::extract(item).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn offsets_place_items_after_the_base() {
        // ---
        let item = json!({"tso": 10, "id": "d1", "lat": 10.0, "lon": 20.0});
        let ts = actual_timestamp(&item, Some(base()), None);
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:30+00:00");

        let later = json!({"tso": 20, "id": "d1", "perc": 42});
        let ts = actual_timestamp(&later, Some(base()), None);
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:40+00:00");
    }

    #[test]
    fn bts_item_sits_exactly_at_the_base() {
        // ---
        let item = json!({"bts": 1_700_000_000, "perc": 10});
        let ts = actual_timestamp(&item, Some(base()), Some(base()));
        assert_eq!(ts, base());
    }

    #[test]
    fn offset_without_base_falls_back_to_timestamp_or_now() {
        // ---
        let item = json!({"tso": 10, "timestamp": 1_600_000_000});
        let ts = actual_timestamp(&item, None, None);
        assert_eq!(ts.timestamp(), 1_600_000_000);

        let bare = json!({"tso": 10});
        let before = Utc::now();
        let ts = actual_timestamp(&bare, None, None);
        assert!(ts >= before);
    }

    #[test]
    fn session_markers_are_recognized() {
        // ---
        let marker = json!({
            "bts": 1_700_000_000,
            "source_ip": "10.0.0.1",
            "user_agent": "agent",
            "batch_id": "batch_x",
        });
        assert!(is_session_marker(marker.as_object().unwrap()));

        let data = json!({"bts": 1_700_000_000, "perc": 42, "source_ip": "10.0.0.1"});
        assert!(!is_session_marker(data.as_object().unwrap()));
    }
}
