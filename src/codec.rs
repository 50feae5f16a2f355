//! Inbound payload codec.
//!
//! Devices send whatever their firmware was built with: raw-deflate JSON,
//! gzip JSON, plain JSON, or (for the most constrained trackers) a
//! compressed fixed-layout binary frame selected by the
//! `x-compression-type: maximum` header. Each decode attempt is isolated;
//! failure of one simply moves on to the next candidate.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use serde_json::{json, Map, Value};

use crate::error::DecodeError;

/// Decompression output cap. A 5 MiB request body must not inflate into
/// something unbounded.
const MAX_INFLATED_BYTES: u64 = 32 * 1024 * 1024;

// ---

/// Decode a request body into a JSON value.
///
/// Attempts, in order: raw deflate (no zlib header), gzip, plain JSON,
/// and finally lossy UTF-8 text that is braced like an object. Returns
/// [`DecodeError::Unrecognized`] with size and a hex preview of the first
/// 100 bytes when nothing matches.
pub fn decode(raw: &[u8]) -> Result<Value, DecodeError> {
    // ---
    if let Some(v) = try_inflate(DeflateDecoder::new(raw)) {
        return Ok(v);
    }
    if let Some(v) = try_inflate(GzDecoder::new(raw)) {
        return Ok(v);
    }
    if let Ok(v) = serde_json::from_slice::<Value>(raw) {
        return Ok(v);
    }

    // Last resort: tolerate stray leading/trailing bytes around an object.
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            return Ok(v);
        }
    }

    Err(DecodeError::Unrecognized {
        raw_size: raw.len(),
        preview: hex::encode(&raw[..raw.len().min(100)]),
    })
}

fn try_inflate<R: Read>(decoder: R) -> Option<Value> {
    // ---
    let mut buf = Vec::new();
    let mut limited = decoder.take(MAX_INFLATED_BYTES);
    limited.read_to_end(&mut buf).ok()?;
    serde_json::from_slice(&buf).ok()
}

// ---

/// Operator codes carried in the binary frame.
const OPERATORS: &[&str] = &[
    "unknown", "vodafone", "orange", "t-mobile", "telefonica", "att", "verizon", "mtn", "airtel",
];

/// Network technology codes.
const NETWORK_TYPES: &[&str] = &["unknown", "gsm", "umts", "lte", "nr", "nbiot", "catm1"];

/// Device model codes.
const DEVICE_MODELS: &[&str] = &[
    "unknown", "tk102", "tk103", "gl300", "gl320", "fmb920", "fmb130", "custom",
];

fn lookup(table: &[&str], code: u8) -> String {
    // ---
    table
        .get(code as usize)
        .copied()
        .unwrap_or("unknown")
        .to_string()
}

/// Section flags for the optional trailing bitmask.
const SECTION_CAPACITY: u8 = 0x01;
const SECTION_BSSID: u8 = 0x02;
const SECTION_CELL_ID: u8 = 0x04;
const SECTION_THROUGHPUT: u8 = 0x08;

/// Decode the compressed fixed-layout binary frame.
///
/// The envelope is zlib-compressed; the inflated frame is big-endian with
/// the layout documented field by field below. A trailing bitmask byte,
/// when present, enables optional sections appended after offset 18.
pub fn decode_binary(raw: &[u8]) -> Result<Value, DecodeError> {
    // ---
    let mut frame = Vec::new();
    ZlibDecoder::new(raw)
        .take(MAX_INFLATED_BYTES)
        .read_to_end(&mut frame)
        .map_err(|e| DecodeError::Envelope(e.to_string()))?;

    if frame.len() < 18 {
        return Err(DecodeError::ShortFrame(frame.len()));
    }

    let device_hash = u16::from_be_bytes([frame[0], frame[1]]);
    let lat = i32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as f64 / 1e6;
    let lon = i32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as f64 / 1e6;
    let altitude = i16::from_be_bytes([frame[10], frame[11]]);

    if !(-90.0..=90.0).contains(&lat) {
        return Err(DecodeError::FieldRange("lat"));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(DecodeError::FieldRange("lon"));
    }

    let mut out = Map::new();
    out.insert("id".into(), json!(format!("dev_{device_hash:04x}")));
    out.insert("lat".into(), json!(lat));
    out.insert("lon".into(), json!(lon));
    out.insert("alt".into(), json!(altitude));

    let battery = frame[12];
    out.insert(
        "perc".into(),
        if battery <= 100 {
            json!(battery)
        } else {
            Value::Null
        },
    );

    let rssi = i16::from(frame[13]) - 150;
    if (-150..=0).contains(&rssi) {
        out.insert("rssi".into(), json!(rssi));
    }

    // One byte of speed can never exceed the valid 0..=500 km/h range.
    out.insert("speed".into(), json!(frame[14]));

    let accuracy = frame[15];
    out.insert("acc".into(), json!(accuracy));

    out.insert("operator".into(), json!(lookup(OPERATORS, frame[16])));
    out.insert("net".into(), json!(lookup(NETWORK_TYPES, frame[17])));
    if frame.len() > 18 {
        out.insert("model".into(), json!(lookup(DEVICE_MODELS, frame[18])));
    }

    // Optional sections, gated by a trailing bitmask after the model byte.
    if frame.len() > 19 {
        decode_sections(&frame[20..], frame[19], &mut out)?;
    }

    Ok(Value::Object(out))
}

fn decode_sections(mut rest: &[u8], mask: u8, out: &mut Map<String, Value>) -> Result<(), DecodeError> {
    // ---
    if mask & SECTION_CAPACITY != 0 {
        let (bytes, tail) = split_section(rest, 2, "capacity")?;
        out.insert(
            "capacity".into(),
            json!(u16::from_be_bytes([bytes[0], bytes[1]])),
        );
        rest = tail;
    }
    if mask & SECTION_BSSID != 0 {
        let (bytes, tail) = split_section(rest, 6, "bssid")?;
        let rendered = bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        out.insert("bssid".into(), json!(rendered));
        rest = tail;
    }
    if mask & SECTION_CELL_ID != 0 {
        let (bytes, tail) = split_section(rest, 4, "cell_id")?;
        out.insert(
            "cell_id".into(),
            json!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        );
        rest = tail;
    }
    if mask & SECTION_THROUGHPUT != 0 {
        let (bytes, _) = split_section(rest, 4, "throughput")?;
        let dn = u16::from_be_bytes([bytes[0], bytes[1]]);
        let up = u16::from_be_bytes([bytes[2], bytes[3]]);
        out.insert("dn_mbps".into(), json!(f64::from(dn) / 10.0));
        out.insert("up_mbps".into(), json!(f64::from(up) / 10.0));
    }
    Ok(())
}

fn split_section<'a>(
    rest: &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<(&'a [u8], &'a [u8]), DecodeError> {
    // ---
    if rest.len() < len {
        return Err(DecodeError::FieldRange(field));
    }
    Ok(rest.split_at(len))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        // ---
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        // ---
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        // ---
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decode_round_trips_all_three_encodings() {
        // ---
        let v = json!({"id": "d1", "lat": 10.5, "nested": {"a": [1, 2, 3]}});
        let plain = serde_json::to_vec(&v).unwrap();

        assert_eq!(decode(&plain).unwrap(), v);
        assert_eq!(decode(&deflate(&plain)).unwrap(), v);
        assert_eq!(decode(&gzip(&plain)).unwrap(), v);
    }

    #[test]
    fn decode_tolerates_padded_object_text() {
        // ---
        let raw = b"  {\"id\": \"d1\"}  ";
        assert_eq!(decode(raw).unwrap(), json!({"id": "d1"}));
    }

    #[test]
    fn decode_rejects_garbage_with_preview() {
        // ---
        let err = decode(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        match err {
            DecodeError::Unrecognized { raw_size, preview } => {
                assert_eq!(raw_size, 4);
                assert_eq!(preview, "deadbeef");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    fn base_frame() -> Vec<u8> {
        // ---
        let mut frame = Vec::new();
        frame.extend_from_slice(&0xab_cdu16.to_be_bytes()); // device hash
        frame.extend_from_slice(&48_856_613i32.to_be_bytes()); // lat
        frame.extend_from_slice(&2_352_222i32.to_be_bytes()); // lon
        frame.extend_from_slice(&120i16.to_be_bytes()); // altitude
        frame.push(87); // battery
        frame.push(65); // rssi + 150 => -85
        frame.push(30); // speed
        frame.push(12); // accuracy
        frame.push(1); // operator: vodafone
        frame.push(3); // network: lte
        frame
    }

    #[test]
    fn binary_frame_fixed_fields() {
        // ---
        let decoded = decode_binary(&zlib(&base_frame())).unwrap();
        assert_eq!(decoded["id"], json!("dev_abcd"));
        assert!((decoded["lat"].as_f64().unwrap() - 48.856613).abs() < 1e-9);
        assert!((decoded["lon"].as_f64().unwrap() - 2.352222).abs() < 1e-9);
        assert_eq!(decoded["alt"], json!(120));
        assert_eq!(decoded["perc"], json!(87));
        assert_eq!(decoded["rssi"], json!(-85));
        assert_eq!(decoded["speed"], json!(30));
        assert_eq!(decoded["acc"], json!(12));
        assert_eq!(decoded["operator"], json!("vodafone"));
        assert_eq!(decoded["net"], json!("lte"));
    }

    #[test]
    fn binary_frame_optional_sections() {
        // ---
        let mut frame = base_frame();
        frame.push(4); // model: gl320
        frame.push(SECTION_CAPACITY | SECTION_THROUGHPUT);
        frame.extend_from_slice(&4200u16.to_be_bytes()); // capacity
        frame.extend_from_slice(&123u16.to_be_bytes()); // dn tenths
        frame.extend_from_slice(&45u16.to_be_bytes()); // up tenths

        let decoded = decode_binary(&zlib(&frame)).unwrap();
        assert_eq!(decoded["model"], json!("gl320"));
        assert_eq!(decoded["capacity"], json!(4200));
        assert_eq!(decoded["dn_mbps"], json!(12.3));
        assert_eq!(decoded["up_mbps"], json!(4.5));
    }

    #[test]
    fn binary_frame_rejects_short_and_out_of_range() {
        // ---
        assert!(matches!(
            decode_binary(&zlib(&[0u8; 10])).unwrap_err(),
            DecodeError::ShortFrame(10)
        ));

        let mut frame = base_frame();
        frame[2..6].copy_from_slice(&95_000_000i32.to_be_bytes()); // lat 95.0
        assert!(matches!(
            decode_binary(&zlib(&frame)).unwrap_err(),
            DecodeError::FieldRange("lat")
        ));
    }

    #[test]
    fn binary_battery_over_100_is_null() {
        // ---
        let mut frame = base_frame();
        frame[12] = 130;
        let decoded = decode_binary(&zlib(&frame)).unwrap();
        assert_eq!(decoded["perc"], Value::Null);
    }

    #[test]
    fn binary_speed_keeps_full_byte_range() {
        // ---
        let mut frame = base_frame();
        frame[14] = 255;
        let decoded = decode_binary(&zlib(&frame)).unwrap();
        assert_eq!(decoded["speed"], json!(255));
    }
}
