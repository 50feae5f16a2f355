//! Per-sample enrichment entry point.
//!
//! Every ingestion path (single telemetry, batch stream, delta replay)
//! funnels coordinate-bearing samples through [`WeatherPipeline::enrich`]:
//! position decision first, then either a full fetch through the
//! coordinator or a cache-only read when the stored weather is still
//! current for this device.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::validate::has_usable_coordinates;

use super::position::PositionTracker;
use super::rate_limit::GlobalRateLimiter;
use super::WeatherService;

// ---

pub struct WeatherPipeline {
    tracker: PositionTracker,
    limiter: GlobalRateLimiter,
    service: Arc<WeatherService>,
}

impl WeatherPipeline {
    pub fn new(
        tracker: PositionTracker,
        limiter: GlobalRateLimiter,
        service: Arc<WeatherService>,
    ) -> Self {
        // ---
        Self {
            tracker,
            limiter,
            service,
        }
    }

    pub fn service(&self) -> &WeatherService {
        &self.service
    }

    /// Enrich one sample in place. Returns the decision reason, or
    /// `None` when the sample has no usable coordinates.
    ///
    /// A positive decision runs the full cache-then-providers flow; a
    /// negative one still attaches cached weather when a fresh entry
    /// covers the coordinate. Enrichment never fails the sample: a
    /// fetch failure leaves only the decision annotation behind.
    pub async fn enrich(&self, device_id: &str, sample: &mut Value) -> Option<String> {
        // ---
        if !has_usable_coordinates(sample) {
            return None;
        }
        let lat = sample.get("lat").and_then(Value::as_f64)?;
        let lon = sample.get("lon").and_then(Value::as_f64)?;

        let (update, reason) = self
            .tracker
            .should_force_weather_update(&self.limiter, device_id, lat, lon)
            .await;

        let weather = if update {
            self.service.get_weather(lat, lon).await
        } else {
            self.service.cached_weather(lat, lon).await
        };

        if let Some(obj) = sample.as_object_mut() {
            if let Some(weather) = weather {
                obj.insert("weather".to_string(), weather);
            }
            obj.insert("weather_decision".to_string(), json!(reason));
        }
        debug!("enriched {device_id}: {reason}");
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::kv::KvClient;
    use crate::weather::disk_cache::{FixedDiskProbe, WeatherCacheConfig, WeatherDiskCache};
    use crate::weather::position::PositionConfig;
    use crate::weather::providers::{ProviderConfig, WeatherProviders};
    use bb8_redis::{bb8, RedisConnectionManager};
    use std::time::Duration;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir) -> WeatherPipeline {
        // ---
        // Backends point at unreachable endpoints; only the local and
        // on-disk paths run in these tests.
        let mgr = RedisConnectionManager::new("redis://127.0.0.1:1/").unwrap();
        let pool = bb8::Pool::builder().build_unchecked(mgr);
        let (kv, _worker) = KvClient::new(pool);

        let cache = WeatherDiskCache::new(
            WeatherCacheConfig {
                dir: dir.path().to_path_buf(),
                ..WeatherCacheConfig::default()
            },
            Arc::new(FixedDiskProbe::new(10_000)),
        )
        .unwrap();
        let providers = WeatherProviders::new(ProviderConfig {
            openmeteo_url: "http://127.0.0.1:1/forecast".to_string(),
            openmeteo_marine_url: "http://127.0.0.1:1/marine".to_string(),
            wttr_url: "http://127.0.0.1:1".to_string(),
        });
        let service = Arc::new(WeatherService::new(Arc::new(cache), Arc::new(providers)));

        let tracker = PositionTracker::new(
            kv.clone(),
            PositionConfig {
                movement_threshold_km: 1.0,
                weather_expiration: Duration::from_secs(3600),
                weather_cooldown: Duration::from_secs(30),
            },
        );
        let limiter = GlobalRateLimiter::new(kv, 8, 12);
        WeatherPipeline::new(tracker, limiter, service)
    }

    #[tokio::test]
    async fn sample_without_coordinates_is_left_alone() {
        // ---
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        let mut sample = serde_json::json!({"id": "d1", "perc": 80});
        assert!(p.enrich("d1", &mut sample).await.is_none());
        assert!(sample.get("weather_decision").is_none());
    }

    #[tokio::test]
    async fn decision_is_attached_even_when_fetch_fails() {
        // ---
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        let mut sample = serde_json::json!({"id": "d1", "lat": 48.85, "lon": 2.35});

        let reason = p.enrich("d1", &mut sample).await.unwrap();
        assert_eq!(reason, "first_request");
        assert_eq!(sample["weather_decision"], serde_json::json!("first_request"));
        assert!(sample.get("weather").is_none());
    }

    #[tokio::test]
    async fn cached_weather_is_attached_on_fetch() {
        // ---
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        p.service
            .cache()
            .store(48.85, 2.35, &serde_json::json!({"temperature": 19.0}));

        let mut sample = serde_json::json!({"id": "d1", "lat": 48.85, "lon": 2.35});
        p.enrich("d1", &mut sample).await.unwrap();
        assert_eq!(sample["weather"]["temperature"], serde_json::json!(19.0));
    }
}
