//! Database schema management for `fleetsink`.
//!
//! Ensures required tables, indexes, and SQL helpers exist before serving
//! requests. Applied once on startup from `main.rs`. Safe to call on every
//! startup; no-op if objects already exist.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `latest_device_states` table (one merged document per
/// device), the month-partitioned `timestamped_data` history table, the
/// `ingested_data` work queue, and the `jsonb_recursive_merge` helper the
/// merge-mode upsert relies on.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Latest merged state per device, served by the read surface.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS latest_device_states (
            device_id   TEXT PRIMARY KEY,
            payload     JSONB       NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Append-mostly history, partitioned by calendar month of the data
    // timestamp. Partitions are created on demand by the partition manager.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS timestamped_data (
            device_id      TEXT        NOT NULL,
            payload        JSONB       NOT NULL,
            data_timestamp TIMESTAMPTZ NOT NULL,
            data_type      TEXT        NOT NULL DEFAULT 'telemetry',
            is_offline     BOOLEAN     NOT NULL DEFAULT false,
            batch_id       TEXT,
            UNIQUE (device_id, data_timestamp)
        ) PARTITION BY RANGE (data_timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Raw landing queue for inbound telemetry.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingested_data (
            id          BIGSERIAL PRIMARY KEY,
            device_id   TEXT        NOT NULL,
            payload     JSONB       NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Recursive jsonb merge: objects merge level by level, scalars from
    // the right side win. Mirrors merge::deep_merge so concurrent upserts
    // stay commutative inside the database.
    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION jsonb_recursive_merge(a JSONB, b JSONB)
        RETURNS JSONB LANGUAGE SQL IMMUTABLE AS $$
            SELECT jsonb_object_agg(
                COALESCE(ka, kb),
                CASE
                    WHEN va IS NULL THEN vb
                    WHEN vb IS NULL THEN va
                    WHEN jsonb_typeof(va) = 'object' AND jsonb_typeof(vb) = 'object'
                        THEN jsonb_recursive_merge(va, vb)
                    ELSE vb
                END
            )
            FROM jsonb_each(a) e1(ka, va)
            FULL JOIN jsonb_each(b) e2(kb, vb) ON ka = kb
        $$;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
