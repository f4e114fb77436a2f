//! Wire types for the geobatch HTTP surface that are not already
//! domain types.
//!
//! Download requests arrive as [`crate::pipeline::DownloadRequest`]:
//!
//! ```json
//! {
//!   "dataset_id": "landcover",
//!   "aoi": { "bbox": [-12.48, 35.60, 32.87, 70.29] },
//!   "time_range": { "start": "2024-05-01T00:00:00Z", "end": "2024-05-31T00:00:00Z" },
//!   "resolution": 100.0
//! }
//! ```
//!
//! Task records are returned as-is ([`crate::tasks::DownloadTask`]).

use serde::{Deserialize, Serialize};

use crate::observability::MetricsSnapshot;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub regions: usize,
    pub metrics: MetricsSnapshot,
}
