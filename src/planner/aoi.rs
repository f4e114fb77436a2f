use geo::{Densify, Euclidean, MultiPolygon, Rect, coord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::regions::RegionCatalog;

/// Longest edge, in degrees, of a bbox ring before projection. Parallels
/// curve in most projected CRSs, so corner-only rings would cut the area.
const BBOX_EDGE_STEP_DEGREES: f64 = 0.1;

#[derive(Debug, Error)]
pub enum AoiError {
    #[error("invalid bounding box {bbox:?}: {reason}")]
    InvalidBoundingBox { bbox: [f64; 4], reason: &'static str },

    #[error("region not found: {0}")]
    RegionNotFound(String),
}

/// Where a request's area of interest comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AoiSource {
    /// `[min_lon, min_lat, max_lon, max_lat]` in degrees
    Bbox([f64; 4]),
    /// Code looked up in the region catalog
    Region(String),
}

/// Polygonal area in WGS84 lon/lat. Immutable once built.
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    geometry: MultiPolygon<f64>,
}

impl AreaOfInterest {
    pub fn from_bbox(bbox: [f64; 4]) -> Result<Self, AoiError> {
        let [min_x, min_y, max_x, max_y] = bbox;
        let invalid = |reason| AoiError::InvalidBoundingBox { bbox, reason };

        if bbox.iter().any(|v| !v.is_finite()) {
            return Err(invalid("coordinates must be finite"));
        }
        if min_x >= max_x || min_y >= max_y {
            return Err(invalid("min must be strictly less than max"));
        }
        if min_x < -180.0 || max_x > 180.0 {
            return Err(invalid("longitude out of range"));
        }
        if min_y < -90.0 || max_y > 90.0 {
            return Err(invalid("latitude out of range"));
        }

        let rect = Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y });
        let ring = rect
            .to_polygon()
            .densify::<Euclidean>(BBOX_EDGE_STEP_DEGREES);
        Ok(Self {
            geometry: MultiPolygon(vec![ring]),
        })
    }

    pub fn from_geometry(geometry: MultiPolygon<f64>) -> Self {
        Self { geometry }
    }

    pub fn resolve(source: &AoiSource, regions: &RegionCatalog) -> Result<Self, AoiError> {
        match source {
            AoiSource::Bbox(bbox) => Self::from_bbox(*bbox),
            AoiSource::Region(code) => regions
                .lookup(code)
                .map(|geometry| Self::from_geometry(geometry.clone()))
                .ok_or_else(|| AoiError::RegionNotFound(code.clone())),
        }
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }
}
