//! Monthly partition manager for `timestamped_data`.
//!
//! History rows land in a child table named for the calendar month of
//! their data timestamp (`timestamped_data_yYYYYmMM`). Known-existing
//! partition names are cached in memory; creating a missing one is
//! serialized per partition and retried with backoff so a burst of
//! first-of-the-month writes produces exactly one DDL statement.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

const CREATE_RETRIES: u32 = 3;

// ---

/// Derive the partition name for a data timestamp.
pub fn partition_for(ts: DateTime<Utc>) -> String {
    // ---
    format!("timestamped_data_y{}m{:02}", ts.year(), ts.month())
}

/// First instant of the timestamp's month and of the following month.
fn month_bounds(ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    // ---
    let start = ts
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
        .unwrap_or(ts);
    let (ny, nm) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    let end = start
        .date_naive()
        .with_year(ny)
        .and_then(|d| d.with_month(nm))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
        .unwrap_or(start);
    (start, end)
}

/// Serializes partition creation and remembers what already exists.
pub struct PartitionManager {
    known: Mutex<HashSet<String>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for PartitionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionManager {
    pub fn new() -> Self {
        // ---
        Self {
            known: Mutex::new(HashSet::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the partition covering `ts` exists, creating it if needed.
    ///
    /// Fast path is a set lookup. The slow path takes the per-partition
    /// mutex so concurrent writers for the same month issue one DDL, and
    /// retries transient failures with linear backoff.
    pub async fn ensure_partition(
        &self,
        pool: &PgPool,
        ts: DateTime<Utc>,
    ) -> Result<String, sqlx::Error> {
        // ---
        let name = partition_for(ts);
        if self.known.lock().await.contains(&name) {
            return Ok(name);
        }

        let lock = {
            let mut locks = self.creation_locks.lock().await;
            Arc::clone(locks.entry(name.clone()).or_default())
        };
        let _guard = lock.lock().await;

        // Another writer may have created it while we waited.
        if self.known.lock().await.contains(&name) {
            return Ok(name);
        }

        let (start, end) = month_bounds(ts);
        let mut last_err = None;
        for attempt in 0..CREATE_RETRIES {
            match create_partition(pool, &name, start, end).await {
                Ok(()) => {
                    self.known.lock().await.insert(name.clone());
                    info!("partition {name} ready");
                    return Ok(name);
                }
                Err(e) => {
                    warn!("partition {name} creation attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(last_err.unwrap_or(sqlx::Error::PoolClosed))
    }
}

async fn create_partition(
    pool: &PgPool,
    name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    // ---
    // Identifiers cannot be bound; the name is derived from a timestamp,
    // never from client input.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name}
        PARTITION OF timestamped_data
        FOR VALUES FROM ('{}') TO ('{}');
        "#,
        start.to_rfc3339(),
        end.to_rfc3339()
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{name}_device_ts ON {name} (device_id, data_timestamp DESC);"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{name}_ts ON {name} (data_timestamp DESC);"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partition_name_format() {
        // ---
        let ts = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 30).unwrap();
        assert_eq!(partition_for(ts), "timestamped_data_y2023m11");

        let jan = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(partition_for(jan), "timestamped_data_y2026m01");
    }

    #[test]
    fn month_bounds_cover_the_month() {
        // ---
        let ts = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 30).unwrap();
        let (start, end) = month_bounds(ts);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 11, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn december_rolls_into_next_year() {
        // ---
        let ts = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = month_bounds(ts);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }
}
