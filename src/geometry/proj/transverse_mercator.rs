//! Transverse Mercator, Krüger n-series to 6th order (Karney 2011).
//! Backs every UTM zone.

use super::{Ellipsoid, Projection, WGS84_ELLIPSOID};
use crate::geometry::GeometryError;

pub struct TransverseMercator {
    ellipsoid: Ellipsoid,
    lon0: f64,
    k0: f64,
    false_easting: f64,
    false_northing: f64,
    /// A = a/(1+n) * (1 + n²/4 + n⁴/64)
    a_hat: f64,
    alpha: [f64; 6],
    beta: [f64; 6],
}

impl TransverseMercator {
    pub fn new(
        ellipsoid: Ellipsoid,
        lon0: f64,
        k0: f64,
        false_easting: f64,
        false_northing: f64,
    ) -> Self {
        let n = ellipsoid.n;
        let p = [n, n.powi(2), n.powi(3), n.powi(4), n.powi(5), n.powi(6)];

        let alpha = [
            p[0] / 2.0 - 2.0 / 3.0 * p[1] + 5.0 / 16.0 * p[2] + 41.0 / 180.0 * p[3]
                - 127.0 / 288.0 * p[4]
                + 7891.0 / 37800.0 * p[5],
            13.0 / 48.0 * p[1] - 3.0 / 5.0 * p[2] + 557.0 / 1440.0 * p[3] + 281.0 / 630.0 * p[4]
                - 1983433.0 / 1935360.0 * p[5],
            61.0 / 240.0 * p[2] - 103.0 / 140.0 * p[3]
                + 15061.0 / 26880.0 * p[4]
                + 167603.0 / 181440.0 * p[5],
            49561.0 / 161280.0 * p[3] - 179.0 / 168.0 * p[4] + 6601661.0 / 7257600.0 * p[5],
            34729.0 / 80640.0 * p[4] - 3418889.0 / 1995840.0 * p[5],
            212378941.0 / 319334400.0 * p[5],
        ];

        let beta = [
            p[0] / 2.0 - 2.0 / 3.0 * p[1] + 37.0 / 96.0 * p[2] - 1.0 / 360.0 * p[3]
                - 81.0 / 512.0 * p[4]
                + 96199.0 / 604800.0 * p[5],
            1.0 / 48.0 * p[1] + 1.0 / 15.0 * p[2] - 437.0 / 1440.0 * p[3] + 46.0 / 105.0 * p[4]
                - 1118711.0 / 3870720.0 * p[5],
            17.0 / 480.0 * p[2] - 37.0 / 840.0 * p[3] - 209.0 / 4480.0 * p[4]
                + 5569.0 / 90720.0 * p[5],
            4397.0 / 161280.0 * p[3] - 11.0 / 504.0 * p[4] - 830251.0 / 7257600.0 * p[5],
            4583.0 / 161280.0 * p[4] - 108847.0 / 3991680.0 * p[5],
            20648693.0 / 638668800.0 * p[5],
        ];

        let a_hat = ellipsoid.a / (1.0 + n) * (1.0 + p[1] / 4.0 + p[3] / 64.0);

        Self {
            ellipsoid,
            lon0,
            k0,
            false_easting,
            false_northing,
            a_hat,
            alpha,
            beta,
        }
    }

    pub fn utm_zone(zone: u8, north: bool) -> Self {
        let lon0 = (f64::from(zone) * 6.0 - 183.0).to_radians();
        let false_northing = if north { 0.0 } else { 10_000_000.0 };
        Self::new(WGS84_ELLIPSOID, lon0, 0.9996, 500_000.0, false_northing)
    }

    fn conformal_tangent(&self, tau: f64) -> f64 {
        let e = self.ellipsoid.eccentricity();
        let tau1 = tau.hypot(1.0);
        let sigma = (e * (e * tau / tau1).atanh()).sinh();
        tau * sigma.hypot(1.0) - sigma * tau1
    }

    /// Newton iteration back from the conformal tangent.
    fn geodetic_tangent(&self, tau_prime: f64) -> f64 {
        let e2 = self.ellipsoid.e2;
        let mut tau = tau_prime;
        for _ in 0..15 {
            let tau1 = tau.hypot(1.0);
            let estimate = self.conformal_tangent(tau);
            let step = (tau_prime - estimate) * (1.0 + (1.0 - e2) * tau * tau)
                / ((1.0 - e2) * tau1 * estimate.hypot(1.0));
            tau += step;
            if step.abs() < 1e-12 * (1.0 + tau.abs()) {
                break;
            }
        }
        tau
    }
}

impl Projection for TransverseMercator {
    fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeometryError> {
        let dlam = lon - self.lon0;
        let tau_prime = self.conformal_tangent(lat.tan());

        let xi_prime = tau_prime.atan2(dlam.cos());
        let eta_prime = (dlam.sin() / tau_prime.hypot(dlam.cos())).asinh();

        let mut xi = xi_prime;
        let mut eta = eta_prime;
        for (j, a) in self.alpha.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi += a * (k * xi_prime).sin() * (k * eta_prime).cosh();
            eta += a * (k * xi_prime).cos() * (k * eta_prime).sinh();
        }

        let x = self.k0 * self.a_hat * eta + self.false_easting;
        let y = self.k0 * self.a_hat * xi + self.false_northing;
        Ok((x, y))
    }

    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        let eta = (x - self.false_easting) / (self.k0 * self.a_hat);
        let xi = (y - self.false_northing) / (self.k0 * self.a_hat);

        let mut xi_prime = xi;
        let mut eta_prime = eta;
        for (j, b) in self.beta.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi_prime -= b * (k * xi).sin() * (k * eta).cosh();
            eta_prime -= b * (k * xi).cos() * (k * eta).sinh();
        }

        let sinh_eta = eta_prime.sinh();
        let cos_xi = xi_prime.cos();
        let tau_prime = xi_prime.sin() / sinh_eta.hypot(cos_xi);

        let lat = self.geodetic_tangent(tau_prime).atan();
        let lon = self.lon0 + sinh_eta.atan2(cos_xi);
        Ok((lon, lat))
    }
}
