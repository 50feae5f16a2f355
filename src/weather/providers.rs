//! Weather provider clients and the fallback chain.
//!
//! Primary is Open-Meteo: the forecast and marine endpoints are queried
//! in parallel under one deadline, and the marine half is optional (it
//! has nothing to say about inland coordinates). Fallback is wttr.in
//! with a shorter deadline and a reduced field set. Each provider sits
//! behind its own adaptive circuit breaker, and a local day-keyed
//! counter keeps total upstream calls under the free-tier quota.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::{Backpressure, ProviderError};
use crate::geo::round3;

/// Upstream calls allowed per UTC day, slightly under the free tier.
const DAILY_QUOTA: u32 = 9500;

/// Total deadline for the Open-Meteo pair.
const OPENMETEO_DEADLINE: Duration = Duration::from_secs(4);

/// Deadline for the wttr.in fallback.
const WTTR_DEADLINE: Duration = Duration::from_secs(3);

const BREAKER_FAILURES: u32 = 3;
const BREAKER_RECOVERY: Duration = Duration::from_secs(60);
const BREAKER_SUCCESSES: u32 = 2;

// ---

/// Provider endpoints, from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub openmeteo_url: String,
    pub openmeteo_marine_url: String,
    pub wttr_url: String,
}

/// The provider chain.
pub struct WeatherProviders {
    http: reqwest::Client,
    cfg: ProviderConfig,
    openmeteo_breaker: CircuitBreaker,
    wttr_breaker: CircuitBreaker,
    /// Day-keyed call counter: (UTC date, calls today).
    quota: Mutex<(NaiveDate, u32)>,
}

impl WeatherProviders {
    pub fn new(cfg: ProviderConfig) -> Self {
        // ---
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .user_agent(concat!("fleetsink/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            cfg,
            openmeteo_breaker: CircuitBreaker::adaptive(
                "openmeteo",
                BREAKER_FAILURES,
                BREAKER_RECOVERY,
                BREAKER_SUCCESSES,
            ),
            wttr_breaker: CircuitBreaker::adaptive(
                "wttr",
                BREAKER_FAILURES,
                BREAKER_RECOVERY,
                BREAKER_SUCCESSES,
            ),
            quota: Mutex::new((Utc::now().date_naive(), 0)),
        }
    }

    /// Breaker states for the health surface.
    pub fn breaker_states(&self) -> [(&'static str, BreakerState); 2] {
        // ---
        [
            ("openmeteo", self.openmeteo_breaker.state()),
            ("wttr", self.wttr_breaker.state()),
        ]
    }

    /// Fetch normalized weather for a coordinate, walking the chain.
    ///
    /// The returned object always carries `weather_source` and
    /// `weather_updated_at` alongside the normalized fields.
    pub async fn fetch(&self, lat: f64, lon: f64) -> Result<Value, ProviderError> {
        // ---
        self.consume_quota()?;

        match self.fetch_openmeteo(lat, lon).await {
            Ok(weather) => return Ok(weather),
            Err(e) => warn!("openmeteo failed for ({lat:.3},{lon:.3}): {e}"),
        }
        self.fetch_wttr(lat, lon).await
    }

    fn consume_quota(&self) -> Result<(), ProviderError> {
        // ---
        let today = Utc::now().date_naive();
        let mut quota = match self.quota.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if quota.0 != today {
            *quota = (today, 0);
        }
        if quota.1 >= DAILY_QUOTA {
            return Err(Backpressure::RateLimited("daily_quota_exceeded".to_string()).into());
        }
        quota.1 += 1;
        Ok(())
    }

    // ---

    /// Forecast and marine queried in parallel under one deadline. A
    /// marine failure degrades to forecast-only; a forecast failure
    /// fails the provider.
    async fn fetch_openmeteo(&self, lat: f64, lon: f64) -> Result<Value, ProviderError> {
        // ---
        self.openmeteo_breaker.check()?;

        let forecast_url = format!(
            "{}?latitude={:.4}&longitude={:.4}&current=temperature_2m,relative_humidity_2m,\
             apparent_temperature,precipitation,weather_code,cloud_cover,pressure_msl,\
             wind_speed_10m,wind_direction_10m,wind_gusts_10m",
            self.cfg.openmeteo_url, lat, lon
        );
        let marine_url = format!(
            "{}?latitude={:.4}&longitude={:.4}&current=wave_height,wave_direction,\
             wave_period,sea_surface_temperature",
            self.cfg.openmeteo_marine_url, lat, lon
        );

        let pair = tokio::time::timeout(OPENMETEO_DEADLINE, async {
            tokio::join!(
                self.get_json("openmeteo", &forecast_url),
                self.get_json("openmeteo", &marine_url),
            )
        })
        .await;

        let (forecast, marine) = match pair {
            Ok(results) => results,
            Err(_) => {
                self.openmeteo_breaker.record_failure();
                return Err(ProviderError::Timeout {
                    provider: "openmeteo",
                });
            }
        };

        let forecast = match forecast {
            Ok(body) => body,
            Err(e) => {
                self.openmeteo_breaker.record_failure();
                return Err(e);
            }
        };

        let mut weather = parse_openmeteo(&forecast).ok_or_else(|| {
            self.openmeteo_breaker.record_failure();
            ProviderError::BadBody {
                provider: "openmeteo",
                detail: "missing current block".to_string(),
            }
        })?;

        match marine {
            Ok(body) => merge_marine(&mut weather, &body),
            Err(e) => debug!("marine data unavailable for ({lat:.3},{lon:.3}): {e}"),
        }

        self.openmeteo_breaker.record_success();
        Ok(finish(weather, "openmeteo", lat, lon))
    }

    async fn fetch_wttr(&self, lat: f64, lon: f64) -> Result<Value, ProviderError> {
        // ---
        self.wttr_breaker.check()?;

        let url = format!("{}/{:.4},{:.4}?format=j1", self.cfg.wttr_url, lat, lon);
        let body = tokio::time::timeout(WTTR_DEADLINE, self.get_json("wttr", &url)).await;

        let body = match body {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => {
                self.wttr_breaker.record_failure();
                return Err(e);
            }
            Err(_) => {
                self.wttr_breaker.record_failure();
                return Err(ProviderError::Timeout { provider: "wttr" });
            }
        };

        let weather = parse_wttr(&body).ok_or_else(|| {
            self.wttr_breaker.record_failure();
            ProviderError::BadBody {
                provider: "wttr",
                detail: "missing current_condition".to_string(),
            }
        })?;

        self.wttr_breaker.record_success();
        Ok(finish(weather, "wttr.in", lat, lon))
    }

    async fn get_json(&self, provider: &'static str, url: &str) -> Result<Value, ProviderError> {
        // ---
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ProviderError::Http { provider, source })?;
        response
            .json()
            .await
            .map_err(|source| ProviderError::Http { provider, source })
    }
}

// ---

/// Open-Meteo field names to normalized names.
const OPENMETEO_FIELDS: &[(&str, &str)] = &[
    ("temperature_2m", "temperature"),
    ("relative_humidity_2m", "humidity"),
    ("apparent_temperature", "apparent_temperature"),
    ("precipitation", "precipitation"),
    ("weather_code", "weather_code"),
    ("cloud_cover", "cloud_cover"),
    ("pressure_msl", "pressure"),
    ("wind_speed_10m", "wind_speed"),
    ("wind_direction_10m", "wind_direction"),
    ("wind_gusts_10m", "wind_gusts"),
];

const MARINE_FIELDS: &[(&str, &str)] = &[
    ("wave_height", "wave_height"),
    ("wave_direction", "wave_direction"),
    ("wave_period", "wave_period"),
    ("sea_surface_temperature", "sea_temperature"),
];

fn parse_openmeteo(body: &Value) -> Option<Map<String, Value>> {
    // ---
    let current = body.get("current")?.as_object()?;
    let mut out = Map::new();
    for (from, to) in OPENMETEO_FIELDS {
        if let Some(v) = current.get(*from) {
            if !v.is_null() {
                out.insert(to.to_string(), v.clone());
            }
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}

fn merge_marine(weather: &mut Map<String, Value>, body: &Value) {
    // ---
    let Some(current) = body.get("current").and_then(Value::as_object) else {
        return;
    };
    for (from, to) in MARINE_FIELDS {
        if let Some(v) = current.get(*from) {
            if !v.is_null() {
                weather.insert(to.to_string(), v.clone());
            }
        }
    }
}

/// wttr.in `j1` carries everything as strings; parse the numerics.
fn parse_wttr(body: &Value) -> Option<Map<String, Value>> {
    // ---
    let current = body.get("current_condition")?.as_array()?.first()?;

    let num = |key: &str| -> Option<Value> {
        current
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
    };

    let mut out = Map::new();
    for (from, to) in [
        ("temp_C", "temperature"),
        ("FeelsLikeC", "apparent_temperature"),
        ("humidity", "humidity"),
        ("precipMM", "precipitation"),
        ("weatherCode", "weather_code"),
        ("cloudcover", "cloud_cover"),
        ("pressure", "pressure"),
        ("windspeedKmph", "wind_speed"),
        ("winddirDegree", "wind_direction"),
    ] {
        if let Some(v) = num(from) {
            out.insert(to.to_string(), v);
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}

fn finish(mut weather: Map<String, Value>, source: &str, lat: f64, lon: f64) -> Value {
    // ---
    weather.insert("weather_source".to_string(), json!(source));
    weather.insert(
        "weather_updated_at".to_string(),
        json!(Utc::now().to_rfc3339()),
    );
    weather.insert("weather_lat".to_string(), json!(round3(lat)));
    weather.insert("weather_lon".to_string(), json!(round3(lon)));
    Value::Object(weather)
}
