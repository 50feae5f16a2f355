//! Global weather-fetch rate limiter.
//!
//! Weather providers are a shared, externally metered resource, so the
//! limit is global across the process (and across processes sharing the
//! Redis instance): a per-minute counter plus a five-minute burst
//! counter, advanced atomically by one server-side script. When Redis is
//! unreachable the limiter degrades to a local per-minute counter with
//! the same minute limit rather than failing open.

use std::sync::Mutex;

use bb8_redis::redis::Script;
use chrono::Utc;
use tracing::{debug, warn};

use crate::kv::KvClient;

/// Atomic check-and-increment over the minute and burst counters.
/// Returns one of `allowed`, `rate_limit_exceeded`, `burst_limit_exceeded`.
const RATE_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local burst = tonumber(redis.call('GET', KEYS[2]) or '0')
if count >= tonumber(ARGV[1]) then
    return 'rate_limit_exceeded'
end
if burst >= tonumber(ARGV[2]) then
    return 'burst_limit_exceeded'
end
redis.call('INCR', KEYS[1])
redis.call('INCR', KEYS[2])
redis.call('EXPIRE', KEYS[1], 60)
redis.call('EXPIRE', KEYS[2], 300)
return 'allowed'
"#;

// ---

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied(String),
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Process-wide limiter instance.
pub struct GlobalRateLimiter {
    kv: KvClient,
    max_per_minute: u32,
    burst_limit: u32,
    script: Script,
    /// Fallback state: (unix minute, count within that minute).
    local: Mutex<(i64, u32)>,
}

impl GlobalRateLimiter {
    pub fn new(kv: KvClient, max_per_minute: u32, burst_limit: u32) -> Self {
        // ---
        Self {
            kv,
            max_per_minute,
            burst_limit,
            script: Script::new(RATE_SCRIPT),
            local: Mutex::new((0, 0)),
        }
    }

    /// Check and consume one weather-fetch slot.
    pub async fn check(&self) -> RateDecision {
        // ---
        let minute = Utc::now().timestamp() / 60;
        match self.check_redis(minute).await {
            Some(decision) => decision,
            None => {
                debug!("rate limiter falling back to local counter");
                self.check_local(minute)
            }
        }
    }

    async fn check_redis(&self, minute: i64) -> Option<RateDecision> {
        // ---
        let key = format!("global:weather_rate:{minute}");
        let burst_key = format!("{key}:burst");

        let mut conn = match self.kv.pool().get().await {
            Ok(c) => c,
            Err(e) => {
                warn!("rate limiter could not reach redis: {e}");
                return None;
            }
        };

        let verdict: String = self
            .script
            .key(&key)
            .key(&burst_key)
            .arg(self.max_per_minute)
            .arg(self.burst_limit)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| warn!("rate script failed: {e}"))
            .ok()?;

        Some(match verdict.as_str() {
            "allowed" => RateDecision::Allowed,
            other => RateDecision::Denied(other.to_string()),
        })
    }

    /// Local fallback: per-minute counter with the same minute limit.
    fn check_local(&self, minute: i64) -> RateDecision {
        // ---
        let mut state = match self.local.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.0 != minute {
            *state = (minute, 0);
        }
        if state.1 >= self.max_per_minute {
            return RateDecision::Denied("rate_limit_exceeded".to_string());
        }
        state.1 += 1;
        RateDecision::Allowed
    }
}
