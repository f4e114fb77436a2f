//! Catalog queries and acquisition-window derivation.
//!
//! A catalog search returns one record per scene. The batch builder needs one
//! time window per acquisition date, so scenes are grouped by UTC calendar
//! day and each group collapses to `[earliest, latest]`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::http::{HttpClient, HttpError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] HttpError),

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidTimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("catalog returned an unusable record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(CatalogError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// RFC 3339 interval as used by STAC `datetime`
    pub fn to_interval(&self) -> String {
        format!("{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogFeature {
    pub timestamp: DateTime<Utc>,
    pub bbox: Option<[f64; 4]>,
}

/// Closed time interval around one acquisition date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[async_trait]
pub trait CatalogQuery: Send + Sync {
    async fn search(
        &self,
        dataset_id: &str,
        bbox: [f64; 4],
        range: &TimeRange,
    ) -> Result<Vec<CatalogFeature>>;
}

/// One window per distinct UTC date, ordered by date.
pub fn acquisition_windows(features: &[CatalogFeature]) -> Vec<AcquisitionWindow> {
    let mut days: BTreeMap<NaiveDate, AcquisitionWindow> = BTreeMap::new();
    for feature in features {
        let ts = feature.timestamp;
        days.entry(ts.date_naive())
            .and_modify(|w| {
                w.start = w.start.min(ts);
                w.end = w.end.max(ts);
            })
            .or_insert(AcquisitionWindow { start: ts, end: ts });
    }
    days.into_values().collect()
}

/// STAC API item search (`POST {url}/search`), following `next` links.
pub struct StacCatalog {
    client: HttpClient,
    url: String,
    page_size: usize,
    max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Vec<StacItem>,
    #[serde(default)]
    links: Vec<StacLink>,
}

#[derive(Debug, Deserialize)]
struct StacItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    properties: StacProperties,
}

#[derive(Debug, Deserialize)]
struct StacProperties {
    datetime: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct StacLink {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

impl StacCatalog {
    pub fn new(client: HttpClient, url: impl Into<String>, page_size: usize, max_pages: usize) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            page_size,
            max_pages,
        }
    }

    fn convert(item: StacItem) -> Result<CatalogFeature> {
        let timestamp = item.properties.datetime.ok_or_else(|| {
            CatalogError::InvalidRecord(format!(
                "item {} has no datetime",
                item.id.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
        let bbox = item
            .bbox
            .filter(|b| b.len() >= 4)
            .map(|b| [b[0], b[1], b[2], b[3]]);
        Ok(CatalogFeature { timestamp, bbox })
    }
}

#[async_trait]
impl CatalogQuery for StacCatalog {
    async fn search(
        &self,
        dataset_id: &str,
        bbox: [f64; 4],
        range: &TimeRange,
    ) -> Result<Vec<CatalogFeature>> {
        let mut url = format!("{}/search", self.url);
        let mut method = Method::POST;
        let mut body = Some(json!({
            "collections": [dataset_id],
            "bbox": bbox,
            "datetime": range.to_interval(),
            "limit": self.page_size,
        }));

        let mut features = Vec::new();
        for page in 0..self.max_pages {
            let result: SearchPage = self
                .client
                .send_json(method.clone(), &url, &[], body.as_ref())
                .await?;
            debug!(dataset_id, page, items = result.features.len(), "Catalog page");

            for item in result.features {
                features.push(Self::convert(item)?);
            }

            let Some(next) = result.links.into_iter().find(|l| l.rel == "next") else {
                break;
            };
            url = next.href;
            method = match next.method.as_deref() {
                Some(m) if m.eq_ignore_ascii_case("GET") => Method::GET,
                Some(_) => Method::POST,
                None if next.body.is_some() => Method::POST,
                None => Method::GET,
            };
            body = if method == Method::POST { next.body } else { None };
        }

        info!(dataset_id, scenes = features.len(), "Catalog search complete");
        Ok(features)
    }
}

/// Fixed answer, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    features: Vec<CatalogFeature>,
}

impl StaticCatalog {
    pub fn new(features: Vec<CatalogFeature>) -> Self {
        Self { features }
    }
}

#[async_trait]
impl CatalogQuery for StaticCatalog {
    async fn search(
        &self,
        _dataset_id: &str,
        _bbox: [f64; 4],
        range: &TimeRange,
    ) -> Result<Vec<CatalogFeature>> {
        Ok(self
            .features
            .iter()
            .filter(|f| f.timestamp >= range.start && f.timestamp <= range.end)
            .cloned()
            .collect())
    }
}
