//! Web Mercator (EPSG:3857), spherical form on the WGS84 semi-major axis.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use super::{Ellipsoid, Projection, WGS84_ELLIPSOID};
use crate::geometry::GeometryError;

/// atan(sinh(pi)): latitude where the projection closes into a square.
const MAX_LAT: f64 = 1.484_422_229_745_332_4;

pub struct WebMercator {
    ellipsoid: Ellipsoid,
}

impl WebMercator {
    pub fn new() -> Self {
        Self {
            ellipsoid: WGS84_ELLIPSOID,
        }
    }
}

impl Default for WebMercator {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for WebMercator {
    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeometryError> {
        let lat = lat.clamp(-MAX_LAT, MAX_LAT);
        let x = self.ellipsoid.a * lon;
        let y = self.ellipsoid.a * (FRAC_PI_4 + lat / 2.0).tan().ln();
        Ok((x, y))
    }

    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        let lon = x / self.ellipsoid.a;
        let lat = 2.0 * (y / self.ellipsoid.a).exp().atan() - FRAC_PI_2;
        Ok((lon, lat))
    }
}
