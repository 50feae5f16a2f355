//! Sample validation.
//!
//! Validation never blocks ingestion on its own: range violations and a
//! missing device id surface as warnings so the sample still lands in
//! storage, while structural errors (non-object payload) are fatal.
//! Downstream stages decide what to do with a warned sample; in practice
//! the weather coordinator skips enrichment for unusable coordinates.

use serde::Serialize;
use serde_json::Value;

// ---

/// Outcome of validating one inbound sample.
#[derive(Debug, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Declared numeric field ranges: (field aliases, min, max, unit).
const NUMERIC_RANGES: &[(&[&str], f64, f64, &str)] = &[
    (&["perc", "battery", "batt"], 0.0, 100.0, "%"),
    (&["rssi", "signal"], -150.0, 0.0, "dBm"),
    (&["speed"], 0.0, 500.0, "km/h"),
    (&["alt", "altitude"], -1000.0, 10000.0, "m"),
    (&["acc", "accuracy"], 0.0, 10000.0, "m"),
];

/// Validate an inbound sample, producing errors and warnings.
///
/// A missing device id is a warning (the ingester fingerprints from the
/// source IP downstream). Out-of-range telemetry is a warning. Coordinate
/// problems are warnings too; ingestion proceeds without enrichment.
pub fn validate(sample: &Value) -> Validation {
    // ---
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(obj) = sample.as_object() else {
        errors.push("payload must be a JSON object".to_string());
        return Validation {
            valid: false,
            errors,
            warnings,
        };
    };

    let has_id = ["id", "device_id", "deviceId", "device", "dev_id"]
        .iter()
        .any(|k| obj.get(*k).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty()));
    if !has_id {
        warnings.push("missing device id; will fingerprint from source".to_string());
    } else if let Some(id) = first_id(obj) {
        if id.len() > 100 {
            warnings.push(format!("device id too long ({} chars), truncating", id.len()));
        }
    }

    for (aliases, min, max, unit) in NUMERIC_RANGES {
        for alias in *aliases {
            if let Some(n) = obj.get(*alias).and_then(Value::as_f64) {
                if n < *min || n > *max {
                    warnings.push(format!(
                        "{alias}={n} outside {min}..{max} {unit}"
                    ));
                }
                break;
            }
        }
    }

    check_coordinates(obj, &mut warnings);

    Validation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn first_id(obj: &serde_json::Map<String, Value>) -> Option<&str> {
    // ---
    ["id", "device_id", "deviceId", "device", "dev_id"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// Coordinates must come as a pair, be finite, in range, and not (0,0).
fn check_coordinates(obj: &serde_json::Map<String, Value>, warnings: &mut Vec<String>) {
    // ---
    let lat = obj.get("lat").and_then(Value::as_f64);
    let lon = obj.get("lon").and_then(Value::as_f64);

    match (lat, lon) {
        (None, None) => {}
        (Some(_), None) | (None, Some(_)) => {
            warnings.push("coordinates must include both lat and lon".to_string());
        }
        (Some(lat), Some(lon)) => {
            if !lat.is_finite() || !lon.is_finite() {
                warnings.push("coordinates must be finite".to_string());
            } else if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                warnings.push(format!("coordinates ({lat}, {lon}) out of range"));
            } else if lat == 0.0 && lon == 0.0 {
                warnings.push("null island coordinates (0, 0) rejected".to_string());
            }
        }
    }
}

/// True when the sample carries coordinates usable for enrichment.
pub fn has_usable_coordinates(sample: &Value) -> bool {
    // ---
    let lat = sample.get("lat").and_then(Value::as_f64);
    let lon = sample.get("lon").and_then(Value::as_f64);
    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            lat.is_finite()
                && lon.is_finite()
                && (-90.0..=90.0).contains(&lat)
                && (-180.0..=180.0).contains(&lon)
                && !(lat == 0.0 && lon == 0.0)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_sample_passes() {
        // ---
        let v = validate(&json!({
            "id": "d1", "lat": 48.85, "lon": 2.35, "perc": 80, "rssi": -70
        }));
        assert!(v.valid);
        assert!(v.errors.is_empty());
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn missing_id_is_warning_not_error() {
        // ---
        let v = validate(&json!({"perc": 50}));
        assert!(v.valid);
        assert_eq!(v.warnings.len(), 1);
        assert!(v.warnings[0].contains("fingerprint"));
    }

    #[test]
    fn non_object_is_fatal() {
        // ---
        let v = validate(&json!([1, 2, 3]));
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 1);
    }

    #[test]
    fn range_violations_are_warnings() {
        // ---
        let v = validate(&json!({"id": "d1", "perc": 140, "rssi": 10, "speed": 900}));
        assert!(v.valid);
        assert_eq!(v.warnings.len(), 3);
    }

    #[test]
    fn coordinate_rules() {
        // ---
        let lone = validate(&json!({"id": "d1", "lat": 10.0}));
        assert!(lone.warnings.iter().any(|w| w.contains("both")));

        let oob = validate(&json!({"id": "d1", "lat": 95.0, "lon": 10.0}));
        assert!(oob.warnings.iter().any(|w| w.contains("out of range")));

        let null_island = validate(&json!({"id": "d1", "lat": 0.0, "lon": 0.0}));
        assert!(null_island.warnings.iter().any(|w| w.contains("null island")));

        assert!(has_usable_coordinates(&json!({"lat": 10.0, "lon": 20.0})));
        assert!(!has_usable_coordinates(&json!({"lat": 0.0, "lon": 0.0})));
        assert!(!has_usable_coordinates(&json!({"lat": 10.0})));
    }
}
