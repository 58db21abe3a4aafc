//! Great-circle geometry on a spherical Earth.
//!
//! # Example
//!
//! ```rust
//! use custodian_perception::geo::haversine_km;
//!
//! // One degree of latitude is roughly 111 km.
//! let d = haversine_km(0.0, 0.0, 1.0, 0.0);
//! assert!((d - 111.19).abs() < 0.01);
//! ```

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points given in decimal degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards against a > 1 from rounding near antipodes.
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// `true` when the point lies within `radius_km` of the centre (boundary
/// inclusive).
pub fn within_radius(lat: f64, lon: f64, center_lat: f64, center_lon: f64, radius_km: f64) -> bool {
    haversine_km(lat, lon, center_lat, center_lon) <= radius_km
}
