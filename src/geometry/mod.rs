//! Polygon reprojection and clipping.
//!
//! Everything here is a pure function over `geo` types. Only polygonal input
//! is accepted; anything else is an [`GeometryError::UnsupportedGeometry`].

pub mod geojson;
pub mod proj;

use geo::{
    Area, BooleanOps, Coord, CoordsIter, Geometry, GeometryCollection, MapCoords, MultiPolygon,
    Rect,
};
use thiserror::Error;

pub use proj::{CrsPipeline, WGS84};

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(&'static str),

    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("coordinate transform failed: {0}")]
    TransformFailed(String),
}

pub type Result<T> = std::result::Result<T, GeometryError>;

fn kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

fn is_empty_collection(geometry: &Geometry<f64>) -> bool {
    matches!(geometry, Geometry::GeometryCollection(gc) if gc.0.is_empty())
}

/// Transform every vertex from `source_crs` to `target_crs`.
pub fn reproject(
    geometry: &Geometry<f64>,
    source_crs: &str,
    target_crs: &str,
) -> Result<Geometry<f64>> {
    if is_empty_collection(geometry) {
        return Ok(geometry.clone());
    }
    if !matches!(geometry, Geometry::Polygon(_) | Geometry::MultiPolygon(_)) {
        return Err(GeometryError::UnsupportedGeometry(kind(geometry)));
    }

    let pipeline = CrsPipeline::new(source_crs, target_crs)?;
    let transform = |c: Coord<f64>| -> Result<Coord<f64>> {
        let (x, y) = pipeline.transform(c.x, c.y)?;
        Ok(Coord { x, y })
    };

    match geometry {
        Geometry::Polygon(p) => Ok(Geometry::Polygon(p.try_map_coords(transform)?)),
        Geometry::MultiPolygon(mp) => Ok(Geometry::MultiPolygon(mp.try_map_coords(transform)?)),
        other => Err(GeometryError::UnsupportedGeometry(kind(other))),
    }
}

/// Reproject a multipolygon, keeping the concrete type.
pub fn reproject_multipolygon(
    geometry: &MultiPolygon<f64>,
    source_crs: &str,
    target_crs: &str,
) -> Result<MultiPolygon<f64>> {
    let reprojected = reproject(
        &Geometry::MultiPolygon(geometry.clone()),
        source_crs,
        target_crs,
    )?;
    normalize_to_multipolygon(&reprojected)
}

pub fn normalize_to_multipolygon(geometry: &Geometry<f64>) -> Result<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Ok(MultiPolygon(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Ok(mp.clone()),
        other if is_empty_collection(other) => Ok(MultiPolygon(Vec::new())),
        other => Err(GeometryError::UnsupportedGeometry(kind(other))),
    }
}

/// Sum of ring coordinate counts across member polygons, closing
/// coordinates included. Zero for anything non-polygonal.
pub fn count_vertices(geometry: &Geometry<f64>) -> usize {
    match geometry {
        Geometry::Polygon(p) => p.coords_count(),
        Geometry::MultiPolygon(mp) => mp.coords_count(),
        _ => 0,
    }
}

/// Intersection of `geometry` with `rect`. Zero-area pieces produced by
/// edge contact are dropped, so a cell that only touches the AOI clips to
/// an empty multipolygon.
pub fn clip_to_rect(geometry: &MultiPolygon<f64>, rect: &Rect<f64>) -> MultiPolygon<f64> {
    let cell = MultiPolygon(vec![rect.to_polygon()]);
    let clipped = geometry.intersection(&cell);
    MultiPolygon(
        clipped
            .0
            .into_iter()
            .filter(|p| p.unsigned_area() > 0.0)
            .collect(),
    )
}

/// Empty collection, the canonical "no geometry" value.
pub fn empty() -> Geometry<f64> {
    Geometry::GeometryCollection(GeometryCollection(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::{BoundingRect, LineString, Point, Polygon, coord, polygon};

    fn square(x0: f64, y0: f64, side: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + side, y: y0),
            (x: x0 + side, y: y0 + side),
            (x: x0, y: y0 + side),
            (x: x0, y: y0),
        ]
    }

    #[test]
    fn test_normalize_variants() {
        let poly = square(0.0, 0.0, 1.0);
        let wrapped = normalize_to_multipolygon(&Geometry::Polygon(poly.clone())).unwrap();
        assert_eq!(wrapped.0.len(), 1);

        let mp = MultiPolygon(vec![poly.clone(), square(5.0, 5.0, 1.0)]);
        let passed = normalize_to_multipolygon(&Geometry::MultiPolygon(mp.clone())).unwrap();
        assert_eq!(passed, mp);

        let emptied = normalize_to_multipolygon(&empty()).unwrap();
        assert!(emptied.0.is_empty());

        let point = Geometry::Point(Point::new(1.0, 2.0));
        assert!(matches!(
            normalize_to_multipolygon(&point),
            Err(GeometryError::UnsupportedGeometry("Point"))
        ));
    }

    #[test]
    fn test_count_vertices() {
        let poly = square(0.0, 0.0, 1.0);
        assert_eq!(count_vertices(&Geometry::Polygon(poly.clone())), 5);

        let mp = MultiPolygon(vec![poly.clone(), poly]);
        assert_eq!(count_vertices(&Geometry::MultiPolygon(mp)), 10);

        let line = Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]));
        assert_eq!(count_vertices(&line), 0);
        assert_eq!(count_vertices(&empty()), 0);
    }

    #[test]
    fn test_reproject_rejects_lines() {
        let line = Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]));
        assert!(matches!(
            reproject(&line, WGS84, "EPSG:3035"),
            Err(GeometryError::UnsupportedGeometry("LineString"))
        ));
    }

    #[test]
    fn test_reproject_empty_passes_through() {
        let out = reproject(&empty(), WGS84, "EPSG:3035").unwrap();
        assert!(is_empty_collection(&out));
    }

    #[test]
    fn test_reproject_polygon_to_laea() {
        let poly = Geometry::Polygon(square(10.0, 52.0, 1.0));
        let out = reproject(&poly, WGS84, "EPSG:3035").unwrap();
        let Geometry::Polygon(projected) = out else {
            panic!("expected polygon");
        };
        let first = projected.exterior().0[0];
        assert_relative_eq!(first.x, 4_321_000.0, epsilon = 1e-6);
        assert_relative_eq!(first.y, 3_210_000.0, epsilon = 1e-6);
        assert_eq!(projected.exterior().0.len(), 5);
    }

    #[test]
    fn test_clip_inside_and_outside() {
        let aoi = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);

        let half = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 5.0, y: 10.0 });
        let clipped = clip_to_rect(&aoi, &half);
        assert_relative_eq!(clipped.unsigned_area(), 50.0, epsilon = 1e-6);

        let outside = Rect::new(coord! { x: 20.0, y: 20.0 }, coord! { x: 30.0, y: 30.0 });
        assert!(clip_to_rect(&aoi, &outside).0.is_empty());

        let touching = Rect::new(coord! { x: 10.0, y: 0.0 }, coord! { x: 20.0, y: 10.0 });
        assert!(clip_to_rect(&aoi, &touching).0.is_empty());
    }

    #[test]
    fn test_clip_keeps_geometry_within_rect() {
        let aoi = MultiPolygon(vec![square(0.0, 0.0, 10.0)]);
        let rect = Rect::new(coord! { x: 2.0, y: 3.0 }, coord! { x: 4.0, y: 7.0 });
        let clipped = clip_to_rect(&aoi, &rect);
        let bounds = clipped.bounding_rect().unwrap();
        assert!(bounds.min().x >= 2.0 - 1e-6 && bounds.max().x <= 4.0 + 1e-6);
        assert!(bounds.min().y >= 3.0 - 1e-6 && bounds.max().y <= 7.0 + 1e-6);
    }
}
