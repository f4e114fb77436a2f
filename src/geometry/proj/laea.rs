//! Lambert Azimuthal Equal Area, ellipsoidal oblique aspect
//! (IOGP guidance note 7-2, method 9820).

use super::{Ellipsoid, GRS80_ELLIPSOID, Projection};
use crate::geometry::GeometryError;

pub struct LambertAzimuthalEqualArea {
    ellipsoid: Ellipsoid,
    lon0: f64,
    lat0: f64,
    false_easting: f64,
    false_northing: f64,
    qp: f64,
    beta0: f64,
    rq: f64,
    d: f64,
}

/// q(φ): authalic latitude helper.
fn qsfn(lat: f64, e: f64) -> f64 {
    let e2 = e * e;
    let sin_lat = lat.sin();
    let es = e * sin_lat;
    (1.0 - e2) * (sin_lat / (1.0 - es * es) - (1.0 / (2.0 * e)) * ((1.0 - es) / (1.0 + es)).ln())
}

impl LambertAzimuthalEqualArea {
    pub fn new(
        ellipsoid: Ellipsoid,
        lon0: f64,
        lat0: f64,
        false_easting: f64,
        false_northing: f64,
    ) -> Self {
        let e = ellipsoid.eccentricity();
        let qp = qsfn(std::f64::consts::FRAC_PI_2, e);
        let q0 = qsfn(lat0, e);
        let beta0 = (q0 / qp).asin();
        let rq = ellipsoid.a * (qp / 2.0).sqrt();
        let d = ellipsoid.a * (lat0.cos() / (1.0 - ellipsoid.e2 * lat0.sin().powi(2)).sqrt())
            / (rq * beta0.cos());

        Self {
            ellipsoid,
            lon0,
            lat0,
            false_easting,
            false_northing,
            qp,
            beta0,
            rq,
            d,
        }
    }

    /// ETRS89-extended / LAEA Europe (EPSG:3035).
    pub fn etrs89() -> Self {
        Self::new(
            GRS80_ELLIPSOID,
            10.0_f64.to_radians(),
            52.0_f64.to_radians(),
            4_321_000.0,
            3_210_000.0,
        )
    }
}

impl Projection for LambertAzimuthalEqualArea {
    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeometryError> {
        let e = self.ellipsoid.eccentricity();
        let beta = (qsfn(lat, e) / self.qp).clamp(-1.0, 1.0).asin();
        let dlam = lon - self.lon0;

        let denom = 1.0
            + self.beta0.sin() * beta.sin()
            + self.beta0.cos() * beta.cos() * dlam.cos();
        if denom <= 0.0 {
            return Err(GeometryError::TransformFailed(format!(
                "antipode of the projection centre: lon={}, lat={}",
                lon.to_degrees(),
                lat.to_degrees()
            )));
        }
        let b = self.rq * (2.0 / denom).sqrt();

        let x = self.false_easting + b * self.d * beta.cos() * dlam.sin();
        let y = self.false_northing
            + (b / self.d)
                * (self.beta0.cos() * beta.sin() - self.beta0.sin() * beta.cos() * dlam.cos());
        Ok((x, y))
    }

    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        let dx = x - self.false_easting;
        let dy = y - self.false_northing;
        let rho = ((dx / self.d).powi(2) + (self.d * dy).powi(2)).sqrt();
        if rho < 1e-9 {
            return Ok((self.lon0, self.lat0));
        }

        let ratio = rho / (2.0 * self.rq);
        if ratio > 1.0 {
            return Err(GeometryError::TransformFailed(format!(
                "({x}, {y}) lies outside the projected disc"
            )));
        }
        let c = 2.0 * ratio.asin();

        let beta_prime = (c.cos() * self.beta0.sin() + self.d * dy * c.sin() * self.beta0.cos() / rho)
            .clamp(-1.0, 1.0)
            .asin();
        let lon = self.lon0
            + (dx * c.sin()).atan2(
                self.d * rho * self.beta0.cos() * c.cos()
                    - self.d * self.d * dy * self.beta0.sin() * c.sin(),
            );

        let e2 = self.ellipsoid.e2;
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let lat = beta_prime
            + (e2 / 3.0 + 31.0 * e4 / 180.0 + 517.0 * e6 / 5040.0) * (2.0 * beta_prime).sin()
            + (23.0 * e4 / 360.0 + 251.0 * e6 / 3780.0) * (4.0 * beta_prime).sin()
            + (761.0 * e6 / 45360.0) * (6.0 * beta_prime).sin();

        Ok((lon, lat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_centre_maps_to_false_origin() {
        let proj = LambertAzimuthalEqualArea::etrs89();
        let (x, y) = proj
            .forward(10.0_f64.to_radians(), 52.0_f64.to_radians())
            .unwrap();
        assert_relative_eq!(x, 4_321_000.0, epsilon = 1e-6);
        assert_relative_eq!(y, 3_210_000.0, epsilon = 1e-6);
    }

    #[test]
    fn test_iogp_reference_point() {
        // IOGP 373-7-2 example: 50N 5E -> E 3962799.45, N 2999718.85
        let proj = LambertAzimuthalEqualArea::etrs89();
        let (x, y) = proj
            .forward(5.0_f64.to_radians(), 50.0_f64.to_radians())
            .unwrap();
        assert_relative_eq!(x, 3_962_799.45, epsilon = 0.05);
        assert_relative_eq!(y, 2_999_718.85, epsilon = 0.05);
    }

    #[test]
    fn test_roundtrip_over_europe() {
        let proj = LambertAzimuthalEqualArea::etrs89();
        for &(lon, lat) in &[(-12.48, 35.6), (32.87, 70.29), (5.0, 50.0), (-12.48, 70.29)] {
            let (x, y) = proj
                .forward(f64::to_radians(lon), f64::to_radians(lat))
                .unwrap();
            let (lon2, lat2) = proj.inverse(x, y).unwrap();
            assert_relative_eq!(lon2.to_degrees(), lon, epsilon = 1e-7);
            assert_relative_eq!(lat2.to_degrees(), lat, epsilon = 1e-7);
        }
    }
}
