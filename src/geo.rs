//! Geodesic helpers for the ingestion pipeline.
//!
//! The weather subsystem keys almost everything on "how far did this device
//! move": cache hits, position expiry, and per-coordinate locking all reduce
//! to a great-circle distance on a spherical Earth.

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// ---

/// Great-circle distance between two points, in kilometers.
///
/// Standard haversine formula on a sphere of radius [`EARTH_RADIUS_KM`].
/// Symmetric in its arguments and bounded by `PI * EARTH_RADIUS_KM`.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    // ---
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}

/// Round a coordinate to three decimal places (~111 m of latitude).
///
/// Used to bucket coordinates for the weather cache file names and the
/// per-coordinate fetch mutex so nearby requests collapse onto one key.
pub fn round3(v: f64) -> f64 {
    // ---
    (v * 1000.0).round() / 1000.0
}

/// Render the canonical bucket key for a coordinate pair.
pub fn coord_key(lat: f64, lon: f64) -> String {
    // ---
    format!("{:.3},{:.3}", round3(lat), round3(lon))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        // ---
        assert!(haversine_km(48.8566, 2.3522, 48.8566, 2.3522) < 1e-9);
    }

    #[test]
    fn known_distance_paris_to_london() {
        // ---
        // Paris -> London is ~343-344 km surface distance.
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 343.5).abs() < 1.5, "got {d}");
    }

    #[test]
    fn symmetry_and_bounds() {
        // ---
        let points = [
            (0.0, 0.0),
            (89.9, 179.9),
            (-89.9, -179.9),
            (45.0, -122.0),
            (-33.86, 151.2),
        ];
        for &(lat1, lon1) in &points {
            for &(lat2, lon2) in &points {
                let d1 = haversine_km(lat1, lon1, lat2, lon2);
                let d2 = haversine_km(lat2, lon2, lat1, lon1);
                assert!((d1 - d2).abs() < 1e-6);
                assert!(d1 >= 0.0);
                assert!(d1 <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
            }
        }
    }

    #[test]
    fn antipodal_points_near_half_circumference() {
        // ---
        let d = haversine_km(0.0, 0.0, 0.0, 180.0);
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1.0);
    }

    #[test]
    fn round3_buckets() {
        // ---
        assert_eq!(round3(48.856613), 48.857);
        assert_eq!(coord_key(48.856613, 2.352222), "48.857,2.352");
    }
}
