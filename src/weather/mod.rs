//! Weather enrichment subsystem.
//!
//! Layers, outermost first: the pipeline decides per device whether a
//! coordinate deserves enrichment (position tracker + global rate
//! limiter), the coordinator serializes concurrent fetches for the same
//! coordinate bucket and runs the cache-then-providers flow, and the
//! provider chain talks to the outside world behind circuit breakers.

pub mod disk_cache;
pub mod pipeline;
pub mod position;
pub mod providers;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::geo::coord_key;

use disk_cache::WeatherDiskCache;
use providers::WeatherProviders;

/// Bound on the keyed-lock map before stale entries are swept.
const LOCK_MAP_BOUND: usize = 512;

// ---

/// Coordinate-keyed fetch coordinator.
///
/// Concurrent requests for the same rounded coordinate share one async
/// mutex, so a burst of devices in the same place costs one upstream
/// call: the first holder fetches and stores, the rest hit the cache.
pub struct WeatherService {
    cache: Arc<WeatherDiskCache>,
    providers: Arc<WeatherProviders>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WeatherService {
    pub fn new(cache: Arc<WeatherDiskCache>, providers: Arc<WeatherProviders>) -> Self {
        // ---
        Self {
            cache,
            providers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn providers(&self) -> &WeatherProviders {
        &self.providers
    }

    pub fn cache(&self) -> &WeatherDiskCache {
        &self.cache
    }

    /// Weather for a coordinate: cache first, then the provider chain,
    /// storing through on a successful fetch. `None` means enrichment is
    /// unavailable right now; ingestion proceeds without it.
    ///
    /// The cache does synchronous filesystem work (a lookup may scan up to
    /// a hundred files), so every disk touch runs on the blocking pool.
    pub async fn get_weather(&self, lat: f64, lon: f64) -> Option<Value> {
        // ---
        let key = coord_key(lat, lon);
        let lock = self.coordinate_lock(&key);
        let _guard = lock.lock().await;

        if let Some(hit) = self.cached_weather(lat, lon).await {
            debug!("weather cache hit for {key}");
            self.log_off_thread(format!("cache_hit {key}")).await;
            return Some(hit);
        }

        match self.providers.fetch(lat, lon).await {
            Ok(weather) => {
                let source = weather
                    .get("weather_source")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let cache = self.cache.clone();
                let doc = weather.clone();
                let line = format!("fetch {key} {source}");
                // Store before releasing the coordinate lock so waiters
                // find the entry instead of fetching again.
                let _ = tokio::task::spawn_blocking(move || {
                    cache.store(lat, lon, &doc);
                    cache.log_request(&line);
                })
                .await;
                Some(weather)
            }
            Err(e) => {
                warn!("weather fetch failed for {key}: {e}");
                self.log_off_thread(format!("fail {key} {}", e.provider())).await;
                None
            }
        }
    }

    /// Cache-only read, used when the position decision says the stored
    /// weather is still current for this device.
    pub async fn cached_weather(&self, lat: f64, lon: f64) -> Option<Value> {
        // ---
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || cache.lookup(lat, lon))
            .await
            .ok()
            .flatten()
    }

    async fn log_off_thread(&self, line: String) {
        // ---
        let cache = self.cache.clone();
        let _ = tokio::task::spawn_blocking(move || cache.log_request(&line)).await;
    }

    fn coordinate_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        // ---
        let mut locks = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks.len() > LOCK_MAP_BOUND {
            // Entries nobody holds can be dropped; holders keep theirs alive.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
