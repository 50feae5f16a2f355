//! JSON merge semantics and device fingerprinting.
//!
//! Two write paths share these helpers: the telemetry path merges an
//! incoming sample over the device's latest state (nested objects merged
//! recursively, scalars overwritten), and the delta path reconstructs a
//! full payload by replaying partial samples over a base document.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// ---

/// Recursively merge `delta` over `base`, returning the merged document.
///
/// For every key in `delta`: if both sides hold objects the merge recurses,
/// otherwise the delta value overwrites. Null and empty values from the
/// delta are literal updates, not deletions. Arrays are scalars here.
pub fn deep_merge(base: &Value, delta: &Value) -> Value {
    // ---
    match (base, delta) {
        (Value::Object(b), Value::Object(d)) => {
            let mut out: Map<String, Value> = b.clone();
            for (k, dv) in d {
                let merged = match out.get(k) {
                    Some(bv) if bv.is_object() && dv.is_object() => deep_merge(bv, dv),
                    _ => dv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        _ => delta.clone(),
    }
}

/// Shallow merge: copy `extra` keys into `item` without overwriting keys
/// the item already carries. Used to stamp `source_ip` / `user_agent` /
/// `batch_id` onto batch items where item fields win on conflict.
pub fn merge_missing(item: &mut Map<String, Value>, extra: &[(&str, Value)]) {
    // ---
    for (k, v) in extra {
        if !item.contains_key(*k) {
            item.insert((*k).to_string(), v.clone());
        }
    }
}

// ---

/// Payload fields that contribute to a device fingerprint, in order.
///
/// These are hardware-ish identifiers that survive across requests even
/// when the client never sends an explicit device id.
const FINGERPRINT_FIELDS: &[&str] = &["imei", "iccid", "imsi", "mac", "model", "cell_id", "mcc"];

/// Derive a stable device identifier from the source IP and selected
/// payload fields. Rendered as `fp_` plus 12 hex characters.
///
/// Samples without any distinguishing field still fingerprint per source
/// IP, which is the best available grouping for anonymous devices.
pub fn device_fingerprint(source_ip: &str, payload: &Value) -> String {
    // ---
    let mut hasher = Sha256::new();
    hasher.update(source_ip.as_bytes());
    for field in FINGERPRINT_FIELDS {
        if let Some(v) = payload.get(*field) {
            hasher.update(field.as_bytes());
            hasher.update(v.to_string().as_bytes());
        }
    }
    let digest = hasher.finalize();
    format!("fp_{}", hex::encode(&digest[..6]))
}

/// Resolve a device id from a sample, falling back to fingerprinting.
///
/// Accepts the id under any of the aliases the field has accumulated in
/// the wild. Ids longer than 100 characters are truncated.
pub fn resolve_device_id(payload: &Value, source_ip: &str) -> String {
    // ---
    for key in ["id", "device_id", "deviceId", "device", "dev_id"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str) {
            let id = id.trim();
            if !id.is_empty() {
                return id.chars().take(100).collect();
            }
        }
    }
    device_fingerprint(source_ip, payload)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_overwrite() {
        // ---
        let base = json!({"perc": 50, "rssi": -90});
        let delta = json!({"perc": 42});
        let merged = deep_merge(&base, &delta);
        assert_eq!(merged, json!({"perc": 42, "rssi": -90}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        // ---
        let base = json!({"battery": {"health": "good", "temp": 30}, "lat": 1.0});
        let delta = json!({"battery": {"temp": 35}});
        let merged = deep_merge(&base, &delta);
        assert_eq!(
            merged,
            json!({"battery": {"health": "good", "temp": 35}, "lat": 1.0})
        );
    }

    #[test]
    fn null_is_a_literal_update() {
        // ---
        let merged = deep_merge(&json!({"a": 1}), &json!({"a": null}));
        assert_eq!(merged, json!({"a": null}));
    }

    #[test]
    fn arrays_overwrite_wholesale() {
        // ---
        let merged = deep_merge(&json!({"cells": [1, 2, 3]}), &json!({"cells": [9]}));
        assert_eq!(merged, json!({"cells": [9]}));
    }

    #[test]
    fn associative_over_scalar_leaves() {
        // ---
        let a = json!({"x": 1, "n": {"p": 1}});
        let b = json!({"y": 2, "n": {"q": 2}});
        let c = json!({"x": 9, "n": {"p": 3, "r": 4}});
        let left = deep_merge(&deep_merge(&a, &b), &c);
        let right = deep_merge(&a, &deep_merge(&b, &c));
        assert_eq!(left, right);
    }

    #[test]
    fn merge_missing_never_overwrites() {
        // ---
        let mut item = json!({"batch_id": "kept"}).as_object().cloned().unwrap();
        merge_missing(
            &mut item,
            &[("batch_id", json!("new")), ("source_ip", json!("10.0.0.1"))],
        );
        assert_eq!(item["batch_id"], json!("kept"));
        assert_eq!(item["source_ip"], json!("10.0.0.1"));
    }

    #[test]
    fn fingerprint_is_stable_and_ip_sensitive() {
        // ---
        let payload = json!({"imei": "350000000000001", "perc": 10});
        let a = device_fingerprint("10.0.0.1", &payload);
        let b = device_fingerprint("10.0.0.1", &payload);
        let c = device_fingerprint("10.0.0.2", &payload);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("fp_"));
        assert_eq!(a.len(), 15);
    }

    #[test]
    fn resolve_prefers_explicit_id() {
        // ---
        let payload = json!({"deviceId": "tracker-7", "imei": "1"});
        assert_eq!(resolve_device_id(&payload, "10.0.0.1"), "tracker-7");

        let anon = json!({"perc": 5});
        assert!(resolve_device_id(&anon, "10.0.0.1").starts_with("fp_"));
    }
}
