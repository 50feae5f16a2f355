//! End-to-end exercises of the ingestion building blocks that run
//! without a database or Redis: payload decoding through validation and
//! identity resolution, and the priority scheduler under load.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use fleetsink::codec;
use fleetsink::merge::{deep_merge, resolve_device_id};
use fleetsink::scheduler::{Priority, PriorityTaskManager, SchedulerConfig, Task};
use fleetsink::timestamp;
use fleetsink::validate;

// ---

#[test]
fn compressed_sample_flows_to_resolved_identity() -> Result<()> {
    // ---
    let sample = json!({
        "id": "truck-42",
        "lat": 48.8566,
        "lon": 2.3522,
        "perc": 81,
        "rssi": -67,
        "ts": 1_700_000_000,
    });

    // The three self-describing encodings all land on the same value.
    let plain = serde_json::to_vec(&sample)?;
    let mut deflate =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    deflate.write_all(&plain)?;
    let deflated = deflate.finish()?;
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&plain)?;
    let gzipped = gz.finish()?;

    for raw in [&plain, &deflated, &gzipped] {
        let decoded = codec::decode(raw)?;
        assert_eq!(decoded, sample);

        let validation = validate::validate(&decoded);
        assert!(validation.valid);
        assert!(validation.warnings.is_empty());

        assert_eq!(resolve_device_id(&decoded, "10.0.0.1"), "truck-42");
        assert_eq!(
            timestamp::extract(&decoded).unwrap().timestamp(),
            1_700_000_000
        );
    }
    Ok(())
}

#[test]
fn anonymous_sample_fingerprints_consistently() -> Result<()> {
    // ---
    let raw = serde_json::to_vec(&json!({"imei": "350000000000001", "perc": 55}))?;
    let decoded = codec::decode(&raw)?;

    let validation = validate::validate(&decoded);
    assert!(validation.valid);
    assert!(validation.warnings.iter().any(|w| w.contains("fingerprint")));

    let id1 = resolve_device_id(&decoded, "203.0.113.9");
    let id2 = resolve_device_id(&decoded, "203.0.113.9");
    assert_eq!(id1, id2);
    assert!(id1.starts_with("fp_"));
    Ok(())
}

#[test]
fn latest_state_accumulates_across_samples() {
    // ---
    let base = json!({"perc": 90, "battery": {"health": "good", "temp": 25}});
    let update = json!({"perc": 85, "battery": {"temp": 31}, "rssi": -70});

    let merged = deep_merge(&base, &update);
    assert_eq!(
        merged,
        json!({
            "perc": 85,
            "battery": {"health": "good", "temp": 31},
            "rssi": -70,
        })
    );
}

// ---

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_completes_mixed_priority_load() {
    // ---
    let manager = PriorityTaskManager::start(SchedulerConfig {
        queue_capacities: [15, 12, 8, 5],
        queue_weights: [0.60, 0.25, 0.10, 0.05],
        worker_count: 3,
        task_age_limit: Duration::from_secs(45),
    });

    let ran = Arc::new(AtomicU64::new(0));
    let mut accepted: u64 = 0;
    let mut refused: u64 = 0;
    for i in 0..30 {
        let priority = match i % 4 {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        };
        let ran = ran.clone();
        let task = Task::new(format!("storage_t{i}"), priority, move || {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        if manager.enqueue(task) {
            accepted += 1;
        } else {
            refused += 1;
        }
    }

    // Everything accepted should complete; refusals match the dropped
    // counter exactly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.stats().completed.load(Ordering::Relaxed) < accepted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "scheduler did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ran.load(Ordering::Relaxed), accepted);
    assert_eq!(manager.stats().dropped.load(Ordering::Relaxed), refused);

    manager.shutdown().await;
}
