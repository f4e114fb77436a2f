//! Minimal GeoJSON (RFC 7946) codec for the polygonal subset the service
//! reads and writes.

use geo::{Coord, LineString, MultiPolygon, Polygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::GeometryError;

type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionTag,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum FeatureTag {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum CollectionTag {
    #[default]
    FeatureCollection,
}

impl Feature {
    pub fn new(geometry: GeoJsonGeometry, properties: Map<String, Value>) -> Self {
        Self {
            kind: FeatureTag::Feature,
            id: None,
            geometry: Some(geometry),
            properties,
        }
    }
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: CollectionTag::FeatureCollection,
            features,
        }
    }
}

fn ring_to_coords(ring: &LineString<f64>) -> Ring {
    ring.0.iter().map(|c| [c.x, c.y]).collect()
}

fn coords_to_ring(ring: &[[f64; 2]]) -> LineString<f64> {
    LineString(ring.iter().map(|&[x, y]| Coord { x, y }).collect())
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Ring> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(ring_to_coords)
        .collect()
}

fn rings_to_polygon(rings: &[Ring]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    Some(Polygon::new(
        coords_to_ring(exterior),
        interiors.iter().map(|r| coords_to_ring(r)).collect(),
    ))
}

impl From<&MultiPolygon<f64>> for GeoJsonGeometry {
    fn from(mp: &MultiPolygon<f64>) -> Self {
        GeoJsonGeometry::MultiPolygon {
            coordinates: mp.0.iter().map(polygon_rings).collect(),
        }
    }
}

impl From<&Rect<f64>> for GeoJsonGeometry {
    fn from(rect: &Rect<f64>) -> Self {
        GeoJsonGeometry::Polygon {
            coordinates: polygon_rings(&rect.to_polygon()),
        }
    }
}

impl TryFrom<&GeoJsonGeometry> for MultiPolygon<f64> {
    type Error = GeometryError;

    fn try_from(geometry: &GeoJsonGeometry) -> Result<Self, Self::Error> {
        match geometry {
            GeoJsonGeometry::Polygon { coordinates } => Ok(MultiPolygon(
                rings_to_polygon(coordinates).into_iter().collect(),
            )),
            GeoJsonGeometry::MultiPolygon { coordinates } => Ok(MultiPolygon(
                coordinates
                    .iter()
                    .filter_map(|p| rings_to_polygon(p))
                    .collect(),
            )),
            GeoJsonGeometry::Unsupported => {
                Err(GeometryError::UnsupportedGeometry("non-polygonal GeoJSON"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    #[test]
    fn test_parse_polygon_and_multipolygon() {
        let raw = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"code": "A"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}},
                {"type": "Feature", "properties": {"code": "B"},
                 "geometry": {"type": "MultiPolygon", "coordinates": [
                    [[[0,0],[1,0],[1,1],[0,0]]],
                    [[[5,5],[6,5],[6,6],[5,5]]]
                 ]}}
            ]
        }"#;
        let fc: FeatureCollection = serde_json::from_str(raw).unwrap();
        assert_eq!(fc.features.len(), 2);

        let a = MultiPolygon::try_from(fc.features[0].geometry.as_ref().unwrap()).unwrap();
        assert_eq!(a.0.len(), 1);
        let b = MultiPolygon::try_from(fc.features[1].geometry.as_ref().unwrap()).unwrap();
        assert_eq!(b.0.len(), 2);
    }

    #[test]
    fn test_point_is_unsupported() {
        let raw = r#"{"type": "Point", "coordinates": [1, 2]}"#;
        let geometry: GeoJsonGeometry = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            MultiPolygon::try_from(&geometry),
            Err(GeometryError::UnsupportedGeometry(_))
        ));
    }

    #[test]
    fn test_rect_serializes_as_closed_polygon() {
        let rect = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 2.0, y: 1.0 });
        let value = serde_json::to_value(GeoJsonGeometry::from(&rect)).unwrap();
        assert_eq!(value["type"], "Polygon");
        let ring = value["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
    }
}
