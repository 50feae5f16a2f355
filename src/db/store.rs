//! Persistence operations for device state and history.
//!
//! Thin sqlx wrappers; callers run them through
//! [`DbManager::safe_db_operation`](super::pool::DbManager::safe_db_operation)
//! so admission control and the breaker apply uniformly.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::config::LatestWriteMode;

// ---

/// One history row bound for `timestamped_data`.
#[derive(Debug, Clone)]
pub struct TimestampedRecord {
    pub device_id: String,
    pub payload: Value,
    pub data_timestamp: DateTime<Utc>,
    pub data_type: &'static str,
    pub is_offline: bool,
    pub batch_id: Option<String>,
}

/// Insert a history row. Duplicate `(device_id, data_timestamp)` pairs
/// are ignored, which makes delta replay idempotent.
pub async fn insert_timestamped(pool: &PgPool, rec: &TimestampedRecord) -> Result<(), sqlx::Error> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO timestamped_data
            (device_id, payload, data_timestamp, data_type, is_offline, batch_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (device_id, data_timestamp) DO NOTHING
        "#,
    )
    .bind(&rec.device_id)
    .bind(&rec.payload)
    .bind(rec.data_timestamp)
    .bind(rec.data_type)
    .bind(rec.is_offline)
    .bind(&rec.batch_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Land the raw inbound payload on the work queue.
pub async fn enqueue_ingested(
    pool: &PgPool,
    device_id: &str,
    payload: &Value,
) -> Result<(), sqlx::Error> {
    // ---
    sqlx::query("INSERT INTO ingested_data (device_id, payload) VALUES ($1, $2)")
        .bind(device_id)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Upsert the latest state for a device.
///
/// `Merge` folds the incoming payload over the stored document with
/// `jsonb_recursive_merge` (telemetry path); `Replace` overwrites the
/// whole document (delta path, which has already reconstructed the full
/// payload in memory). Both refresh `received_at` to the database clock.
pub async fn upsert_latest(
    pool: &PgPool,
    device_id: &str,
    payload: &Value,
    mode: LatestWriteMode,
) -> Result<(), sqlx::Error> {
    // ---
    let sql = match mode {
        LatestWriteMode::Merge => {
            r#"
            INSERT INTO latest_device_states (device_id, payload, received_at)
            VALUES ($1, $2, now())
            ON CONFLICT (device_id) DO UPDATE SET
                payload = jsonb_recursive_merge(latest_device_states.payload, EXCLUDED.payload),
                received_at = now()
            "#
        }
        LatestWriteMode::Replace => {
            r#"
            INSERT INTO latest_device_states (device_id, payload, received_at)
            VALUES ($1, $2, now())
            ON CONFLICT (device_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                received_at = now()
            "#
        }
    };

    sqlx::query(sql)
        .bind(device_id)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Load the latest merged document for a device.
pub async fn get_latest(pool: &PgPool, device_id: &str) -> Result<Option<Value>, sqlx::Error> {
    // ---
    let row: Option<(Value,)> =
        sqlx::query_as("SELECT payload FROM latest_device_states WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(payload,)| payload))
}

/// Delta-path transaction: insert the history row and replace the latest
/// state atomically, so a reconstructed payload never lands half-way.
pub async fn commit_delta(
    pool: &PgPool,
    rec: &TimestampedRecord,
    latest_payload: &Value,
) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO timestamped_data
            (device_id, payload, data_timestamp, data_type, is_offline, batch_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (device_id, data_timestamp) DO NOTHING
        "#,
    )
    .bind(&rec.device_id)
    .bind(&rec.payload)
    .bind(rec.data_timestamp)
    .bind(rec.data_type)
    .bind(rec.is_offline)
    .bind(&rec.batch_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO latest_device_states (device_id, payload, received_at)
        VALUES ($1, $2, now())
        ON CONFLICT (device_id) DO UPDATE SET
            payload = EXCLUDED.payload,
            received_at = now()
        "#,
    )
    .bind(&rec.device_id)
    .bind(latest_payload)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
