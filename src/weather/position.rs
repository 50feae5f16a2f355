//! Per-device position tracking for weather update decisions.
//!
//! Each device's last-fetched coordinates live in a Redis hash
//! (`device:position:<id>`, 30-day TTL, refreshed on every write). The
//! decision whether a new coordinate deserves a weather fetch is pure
//! (first request / cooldown / expiry / movement) so it can be tested
//! without a store; the surrounding method loads, decides, consults the
//! global rate limiter, and persists the right subset of fields.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::geo::haversine_km;
use crate::kv::KvClient;

use super::rate_limit::{GlobalRateLimiter, RateDecision};

/// Position hash TTL.
const POSITION_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

// ---

/// Stored position state for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePosition {
    pub lat: f64,
    pub lon: f64,
    pub last_weather_update: DateTime<Utc>,
    pub weather_update_count: u64,
}

impl DevicePosition {
    /// Parse from the raw hash fields; absent or corrupt fields mean no
    /// usable position.
    fn from_hash(map: &HashMap<String, String>) -> Option<Self> {
        // ---
        Some(Self {
            lat: map.get("lat")?.parse().ok()?,
            lon: map.get("lon")?.parse().ok()?,
            last_weather_update: map
                .get("last_weather_update")?
                .parse::<DateTime<Utc>>()
                .ok()?,
            weather_update_count: map
                .get("weather_update_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Decision thresholds, copied from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct PositionConfig {
    pub movement_threshold_km: f64,
    pub weather_expiration: Duration,
    pub weather_cooldown: Duration,
}

/// Pure decision: should this coordinate trigger a weather fetch?
///
/// Ordering matters: cooldown wins over expiry, expiry wins over the
/// movement check, so a device cannot force fetches by jittering.
pub fn decide(
    position: Option<&DevicePosition>,
    now: DateTime<Utc>,
    lat: f64,
    lon: f64,
    cfg: &PositionConfig,
) -> (bool, String) {
    // ---
    let Some(pos) = position else {
        return (true, "first_request".to_string());
    };

    let age = (now - pos.last_weather_update)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if age < cfg.weather_cooldown {
        return (false, format!("cooldown_active_{}s", age.as_secs()));
    }
    if age > cfg.weather_expiration {
        return (true, format!("expired_{}s", age.as_secs()));
    }

    let moved_km = haversine_km(pos.lat, pos.lon, lat, lon);
    if moved_km >= cfg.movement_threshold_km {
        (true, format!("moved_{moved_km:.2}km"))
    } else {
        (false, format!("cached_distance_{moved_km:.2}km"))
    }
}

// ---

/// Tracker over the KV store plus the global limiter.
pub struct PositionTracker {
    kv: KvClient,
    cfg: PositionConfig,
}

impl PositionTracker {
    pub fn new(kv: KvClient, cfg: PositionConfig) -> Self {
        Self { kv, cfg }
    }

    /// Decide whether to fetch weather for this device at `(lat, lon)`
    /// and persist the position record accordingly.
    ///
    /// Only a positive decision that also passes the global rate limit
    /// advances `last_weather_update` and the update counter; every call
    /// records the current coordinates and last-seen time.
    pub async fn should_force_weather_update(
        &self,
        limiter: &GlobalRateLimiter,
        device_id: &str,
        lat: f64,
        lon: f64,
    ) -> (bool, String) {
        // ---
        let key = format!("device:position:{device_id}");
        let now = Utc::now();

        let stored = self.kv.hgetall(&key).await;
        let position = DevicePosition::from_hash(&stored);
        let (update, reason) = decide(position.as_ref(), now, lat, lon, &self.cfg);
        debug!("position decision for {device_id}: update={update} reason={reason}");

        if !update {
            self.write_observation(&key, lat, lon, now).await;
            return (false, reason);
        }

        match limiter.check().await {
            RateDecision::Allowed => {
                let count = position.map(|p| p.weather_update_count).unwrap_or(0) + 1;
                self.kv
                    .hset_fields(
                        &key,
                        &[
                            ("lat", lat.to_string()),
                            ("lon", lon.to_string()),
                            ("last_weather_update", now.to_rfc3339()),
                            ("weather_update_count", count.to_string()),
                            ("current_lat", lat.to_string()),
                            ("current_lon", lon.to_string()),
                            ("last_seen", now.to_rfc3339()),
                        ],
                        POSITION_TTL,
                    )
                    .await;
                (true, reason)
            }
            RateDecision::Denied(deny) => {
                self.write_observation(&key, lat, lon, now).await;
                (false, format!("global_rate_limit_{deny}"))
            }
        }
    }

    /// Record where the device is without consuming a weather slot.
    async fn write_observation(&self, key: &str, lat: f64, lon: f64, now: DateTime<Utc>) {
        // ---
        self.kv
            .hset_fields(
                key,
                &[
                    ("current_lat", lat.to_string()),
                    ("current_lon", lon.to_string()),
                    ("last_seen", now.to_rfc3339()),
                ],
                POSITION_TTL,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> PositionConfig {
        // ---
        PositionConfig {
            movement_threshold_km: 1.0,
            weather_expiration: Duration::from_secs(3600),
            weather_cooldown: Duration::from_secs(30),
        }
    }

    fn at(secs_ago: i64, now: DateTime<Utc>) -> DevicePosition {
        // ---
        DevicePosition {
            lat: 48.8566,
            lon: 2.3522,
            last_weather_update: now - chrono::Duration::seconds(secs_ago),
            weather_update_count: 3,
        }
    }

    #[test]
    fn no_position_means_first_request() {
        // ---
        let now = Utc::now();
        let (update, reason) = decide(None, now, 10.0, 20.0, &cfg());
        assert!(update);
        assert_eq!(reason, "first_request");
    }

    #[test]
    fn cooldown_blocks_even_large_moves() {
        // ---
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let pos = at(10, now);
        let (update, reason) = decide(Some(&pos), now, 51.5, -0.12, &cfg());
        assert!(!update);
        assert!(reason.starts_with("cooldown_active_"));
    }

    #[test]
    fn expiry_forces_update_without_movement() {
        // ---
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let pos = at(4000, now);
        let (update, reason) = decide(Some(&pos), now, pos.lat, pos.lon, &cfg());
        assert!(update);
        assert!(reason.starts_with("expired_"));
    }

    #[test]
    fn movement_threshold_splits_moved_and_cached() {
        // ---
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let pos = at(120, now);

        // ~0.01 degrees of latitude is ~1.1 km.
        let (update, reason) = decide(Some(&pos), now, pos.lat + 0.01, pos.lon, &cfg());
        assert!(update);
        assert!(reason.starts_with("moved_"), "{reason}");

        let (update, reason) = decide(Some(&pos), now, pos.lat + 0.001, pos.lon, &cfg());
        assert!(!update);
        assert!(reason.starts_with("cached_distance_"), "{reason}");
    }

    #[test]
    fn hash_round_trip() {
        // ---
        let mut map = HashMap::new();
        map.insert("lat".to_string(), "48.8566".to_string());
        map.insert("lon".to_string(), "2.3522".to_string());
        map.insert(
            "last_weather_update".to_string(),
            "2026-08-30T12:00:00+00:00".to_string(),
        );
        map.insert("weather_update_count".to_string(), "7".to_string());

        let pos = DevicePosition::from_hash(&map).unwrap();
        assert_eq!(pos.weather_update_count, 7);
        assert!((pos.lat - 48.8566).abs() < 1e-9);

        map.remove("lat");
        assert!(DevicePosition::from_hash(&map).is_none());
    }
}
