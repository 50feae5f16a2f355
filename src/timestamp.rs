//! Timestamp extraction for inbound samples.
//!
//! Devices report time under several field names and in several shapes:
//! numeric epoch seconds, numeric epoch milliseconds, or an ISO-8601
//! string. Milliseconds are detected by magnitude (anything past 1e12 is
//! treated as ms; that boundary is the year 33658 in seconds).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Field names a timestamp may hide under, checked in order.
const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "ts", "time", "datetime"];

/// Numeric epoch values above this are milliseconds.
const MS_BOUNDARY: f64 = 1e12;

// ---

/// Interpret a numeric epoch value, scaling milliseconds down.
pub fn parse_epoch(raw: f64) -> Option<DateTime<Utc>> {
    // ---
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let seconds = if raw > MS_BOUNDARY { raw / 1000.0 } else { raw };
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Parse one JSON value as a timestamp: number (epoch s or ms), numeric
/// string, or ISO-8601 string.
pub fn parse_value(v: &Value) -> Option<DateTime<Utc>> {
    // ---
    match v {
        Value::Number(n) => parse_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(raw) = s.parse::<f64>() {
                return parse_epoch(raw);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }
        _ => None,
    }
}

/// Pull a timestamp from a sample under any recognized alias.
pub fn extract(sample: &Value) -> Option<DateTime<Utc>> {
    // ---
    TIMESTAMP_ALIASES
        .iter()
        .find_map(|k| sample.get(*k).and_then(parse_value))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn seconds_and_milliseconds() {
        // ---
        let s = parse_epoch(1_700_000_000.0).unwrap();
        let ms = parse_epoch(1_700_000_000_000.0).unwrap();
        assert_eq!(s, ms);
        assert_eq!(s.timestamp(), 1_700_000_000);
    }

    #[test]
    fn iso_strings_parse() {
        // ---
        let dt = parse_value(&json!("2023-11-14T22:13:20+00:00")).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn numeric_strings_parse() {
        // ---
        let dt = parse_value(&json!("1700000000")).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn garbage_is_none() {
        // ---
        assert!(parse_value(&json!("tomorrow")).is_none());
        assert!(parse_value(&json!(null)).is_none());
        assert!(parse_value(&json!(-5)).is_none());
        assert!(parse_epoch(f64::NAN).is_none());
    }

    #[test]
    fn aliases_checked_in_order() {
        // ---
        let sample = json!({"ts": 1_700_000_000, "time": 1});
        assert_eq!(extract(&sample).unwrap().timestamp(), 1_700_000_000);

        let preferred = json!({"timestamp": 1_600_000_000, "ts": 1_700_000_000});
        assert_eq!(extract(&preferred).unwrap().timestamp(), 1_600_000_000);

        assert!(extract(&json!({"perc": 10})).is_none());
    }
}
