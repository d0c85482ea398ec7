//! WGS84 geodetic <-> Earth-Centered-Earth-Fixed conversions.
//!
//! Angles on the public surface are in degrees, distances in meters.
use std::f64::consts::PI;

/// WGS84 semi-major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 semi-minor axis (m)
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

const A2: f64 = WGS84_A * WGS84_A;
const B2: f64 = WGS84_B * WGS84_B;
/// First eccentricity squared
const E2: f64 = (A2 - B2) / A2;
/// Second eccentricity squared
const EP2: f64 = (A2 - B2) / B2;

/// Prime vertical radius of curvature at `lat` (radians).
fn prime_vertical(lat: f64) -> f64 {
    let s = lat.sin();
    WGS84_A / (1.0 - E2 * s * s).sqrt()
}

/// Convert geodetic latitude, longitude (degrees) and ellipsoidal height (m)
/// to ECEF `[x, y, z]` in meters.
pub fn geodetic_to_ecef(lat: f64, lon: f64, alt: f64) -> [f64; 3] {
    let lat = lat.to_radians();
    let lon = lon.to_radians();
    let n = prime_vertical(lat);
    let x = (n + alt) * lat.cos() * lon.cos();
    let y = (n + alt) * lat.cos() * lon.sin();
    let z = ((B2 / A2) * n + alt) * lat.sin();
    [x, y, z]
}

/// Convert ECEF `(x, y, z)` in meters to `[lat, lon, alt]` (degrees, degrees, m).
///
/// Closed form (Bowring), no iteration. `x == 0` is not guarded: the division
/// follows IEEE semantics and a point on the polar axis gives a NaN longitude.
/// Callers must pass non-degenerate positions.
pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> [f64; 3] {
    let p = (x * x + y * y).sqrt();
    let theta = ((z * WGS84_A) / (p * WGS84_B)).atan();
    let (st, ct) = theta.sin_cos();

    let num = z + EP2 * WGS84_B * st * st * st;
    let den = p - E2 * WGS84_A * ct * ct * ct;
    let lat = (num / den).atan();

    // atan only covers half a turn; fix the quadrant from the signs of x and y
    let mut lon = (y / x).atan();
    if x < 0.0 && y < 0.0 {
        lon -= PI;
    }
    if x < 0.0 && y > 0.0 {
        lon += PI;
    }

    let alt = p / lat.cos() - prime_vertical(lat);
    [lat.to_degrees(), lon.to_degrees(), alt]
}
