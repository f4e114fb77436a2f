//! Region-code to polygon lookup.
//!
//! Loaded once at startup from a GeoJSON FeatureCollection and shared behind
//! an `Arc`. Read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use geo::MultiPolygon;
use thiserror::Error;
use tracing::{info, warn};

use crate::geometry::geojson::FeatureCollection;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to read region file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid region GeoJSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
pub struct RegionCatalog {
    regions: HashMap<String, MultiPolygon<f64>>,
}

impl RegionCatalog {
    pub fn load(path: impl AsRef<Path>, code_property: &str) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RegionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_geojson(&raw, code_property)?;
        info!(
            path = %path.display(),
            regions = catalog.len(),
            "Loaded region catalog"
        );
        Ok(catalog)
    }

    /// Features without the code property or a polygonal geometry are
    /// skipped with a warning.
    pub fn from_geojson(raw: &str, code_property: &str) -> Result<Self, RegionError> {
        let collection: FeatureCollection = serde_json::from_str(raw)?;
        let mut regions = HashMap::with_capacity(collection.features.len());

        for (index, feature) in collection.features.iter().enumerate() {
            let Some(code) = feature.properties.get(code_property).and_then(code_string) else {
                warn!(index, code_property, "Region feature has no code, skipping");
                continue;
            };
            let Some(geometry) = feature.geometry.as_ref() else {
                warn!(index, code, "Region feature has no geometry, skipping");
                continue;
            };
            match MultiPolygon::try_from(geometry) {
                Ok(polygon) => {
                    regions.insert(code, polygon);
                }
                Err(e) => warn!(index, code, error = %e, "Skipping region feature"),
            }
        }

        Ok(Self { regions })
    }

    pub fn lookup(&self, code: &str) -> Option<&MultiPolygon<f64>> {
        self.regions.get(code)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn code_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
