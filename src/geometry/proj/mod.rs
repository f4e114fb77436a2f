//! Pure-Rust CRS pipeline for the handful of reference systems the planner
//! works in.
//!
//! Supported codes:
//! - `EPSG:4326` geographic lon/lat in degrees (identity endpoint)
//! - `EPSG:3857` spherical Web Mercator
//! - `EPSG:3035` ETRS89 Lambert Azimuthal Equal Area (Europe)
//! - `EPSG:32601..32660` / `EPSG:32701..32760` UTM north / south

mod laea;
mod mercator;
mod transverse_mercator;

pub use laea::LambertAzimuthalEqualArea;
pub use mercator::WebMercator;
pub use transverse_mercator::TransverseMercator;

use super::GeometryError;

/// Geographic WGS84, the CRS every AOI arrives in.
pub const WGS84: &str = "EPSG:4326";

/// Reference ellipsoid parameters.
#[derive(Clone, Copy, Debug)]
pub struct Ellipsoid {
    /// Semi-major axis (metres)
    pub a: f64,
    /// Flattening
    pub f: f64,
    /// First eccentricity squared
    pub e2: f64,
    /// Third flattening: f / (2 - f)
    pub n: f64,
}

impl Ellipsoid {
    pub const fn new(a: f64, f: f64) -> Self {
        Self {
            a,
            f,
            e2: 2.0 * f - f * f,
            n: f / (2.0 - f),
        }
    }

    pub fn eccentricity(&self) -> f64 {
        self.e2.sqrt()
    }
}

pub const WGS84_ELLIPSOID: Ellipsoid = Ellipsoid::new(6_378_137.0, 1.0 / 298.257_223_563);
pub const GRS80_ELLIPSOID: Ellipsoid = Ellipsoid::new(6_378_137.0, 1.0 / 298.257_222_101);

/// Map projection between geodetic radians and projected metres.
pub trait Projection: Send + Sync {
    /// (lon_rad, lat_rad) -> (easting, northing)
    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeometryError>;

    /// (easting, northing) -> (lon_rad, lat_rad)
    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError>;
}

enum Endpoint {
    Geographic,
    Projected(Box<dyn Projection>),
}

impl Endpoint {
    fn parse(crs: &str) -> Result<Self, GeometryError> {
        let code = crs
            .strip_prefix("EPSG:")
            .or_else(|| crs.strip_prefix("epsg:"))
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| GeometryError::UnsupportedCrs(crs.to_string()))?;

        match code {
            4326 => Ok(Endpoint::Geographic),
            3857 => Ok(Endpoint::Projected(Box::new(WebMercator::new()))),
            3035 => Ok(Endpoint::Projected(Box::new(
                LambertAzimuthalEqualArea::etrs89(),
            ))),
            32601..=32660 => Ok(Endpoint::Projected(Box::new(
                TransverseMercator::utm_zone((code - 32600) as u8, true),
            ))),
            32701..=32760 => Ok(Endpoint::Projected(Box::new(
                TransverseMercator::utm_zone((code - 32700) as u8, false),
            ))),
            _ => Err(GeometryError::UnsupportedCrs(crs.to_string())),
        }
    }

    fn unproject(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        match self {
            Endpoint::Geographic => Ok((x.to_radians(), y.to_radians())),
            Endpoint::Projected(proj) => proj.inverse(x, y),
        }
    }

    fn project(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeometryError> {
        match self {
            Endpoint::Geographic => Ok((lon.to_degrees(), lat.to_degrees())),
            Endpoint::Projected(proj) => proj.forward(lon, lat),
        }
    }
}

/// Source-to-target transform. Coordinates use CRS native units on both
/// ends (degrees for geographic, metres for projected).
pub struct CrsPipeline {
    src: Endpoint,
    dst: Endpoint,
    identity: bool,
}

impl CrsPipeline {
    pub fn new(src_crs: &str, dst_crs: &str) -> Result<Self, GeometryError> {
        let identity = src_crs.eq_ignore_ascii_case(dst_crs);
        Ok(Self {
            src: Endpoint::parse(src_crs)?,
            dst: Endpoint::parse(dst_crs)?,
            identity,
        })
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        if self.identity {
            return Ok((x, y));
        }
        let (lon, lat) = self.src.unproject(x, y)?;
        let (tx, ty) = self.dst.project(lon, lat)?;
        if !tx.is_finite() || !ty.is_finite() {
            return Err(GeometryError::TransformFailed(format!(
                "({x}, {y}) has no finite image"
            )));
        }
        Ok((tx, ty))
    }
}
