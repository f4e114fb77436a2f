use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::geometry::geojson::{Feature, FeatureCollection, GeoJsonGeometry};
use crate::planner::Tile;

/// All tile boundaries of one request, uploaded once and referenced by
/// feature id from every job.
#[derive(Debug, Clone)]
pub struct GeometryPackage {
    pub key: String,
    pub crs: String,
    pub features: Vec<PackageFeature>,
}

#[derive(Debug, Clone)]
pub struct PackageFeature {
    pub feature_id: u32,
    pub tile: Tile,
}

impl GeometryPackage {
    /// Feature ids run `1..=n` in tile order. The key is fresh per call.
    pub fn from_tiles(key_prefix: &str, tiles: &[Tile]) -> Self {
        let crs = tiles
            .first()
            .map(|t| t.bbox_crs.clone())
            .unwrap_or_default();
        let features = tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| PackageFeature {
                feature_id: i as u32 + 1,
                tile: tile.clone(),
            })
            .collect();

        Self {
            key: format!(
                "{}/{}.geojson",
                key_prefix.trim_end_matches('/'),
                Uuid::new_v4()
            ),
            crs,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn to_feature_collection(&self) -> FeatureCollection {
        let features = self
            .features
            .iter()
            .map(|f| {
                let mut properties = Map::new();
                properties.insert("id".into(), json!(f.feature_id));
                properties.insert("width".into(), json!(f.tile.width_px));
                properties.insert("height".into(), json!(f.tile.height_px));
                properties.insert("crs".into(), json!(f.tile.bbox_crs));
                properties.insert(
                    "clip".into(),
                    serde_json::to_value(GeoJsonGeometry::from(&f.tile.clip_geometry))
                        .unwrap_or(Value::Null),
                );
                let mut feature = Feature::new(GeoJsonGeometry::from(&f.tile.rect()), properties);
                feature.id = Some(json!(f.feature_id));
                feature
            })
            .collect();
        FeatureCollection::new(features)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_feature_collection())
    }
}
