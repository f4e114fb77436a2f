use crate::humanize::ByteSize;
use crate::planner::PlanningConstraints;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub regions: RegionsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            registry_path: default_registry_path(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/registry")
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize(1024 * 1024) // 1 MB
}

/// Storage provider type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Memory,
    #[default]
    Local,
    S3,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// S3 access key (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, not from config file)
    #[serde(skip)]
    pub secret_key: Option<String>,
    /// Root directory of the `local` provider
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    #[serde(default = "default_package_prefix")]
    pub package_prefix: String,
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            endpoint: None,
            region: None,
            access_key: None,
            secret_key: None,
            local_root: default_local_root(),
            package_prefix: default_package_prefix(),
            artifact_prefix: default_artifact_prefix(),
        }
    }
}

fn default_bucket() -> String {
    "geobatch".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("data/objects")
}

fn default_package_prefix() -> String {
    "packages".to_string()
}

fn default_artifact_prefix() -> String {
    "artifacts".to_string()
}

/// Tile planning defaults, overridable per request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    #[serde(default = "default_target_crs")]
    pub target_crs: String,
    #[serde(default = "default_resolution")]
    pub resolution_meters: f64,
    #[serde(default = "default_max_pixels_per_side")]
    pub max_pixels_per_side: u64,
    #[serde(default = "default_max_vertex_count")]
    pub max_vertex_count: usize,
    /// Defaults to `max_pixels_per_side * resolution`
    pub max_tile_side_meters: Option<f64>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_crs: default_target_crs(),
            resolution_meters: default_resolution(),
            max_pixels_per_side: default_max_pixels_per_side(),
            max_vertex_count: default_max_vertex_count(),
            max_tile_side_meters: None,
            max_iterations: default_max_iterations(),
        }
    }
}

impl PlannerConfig {
    /// Constraints for one request at `resolution` (or the configured one).
    pub fn constraints(&self, resolution: Option<f64>) -> PlanningConstraints {
        let resolution = resolution.unwrap_or(self.resolution_meters);
        let side = self
            .max_tile_side_meters
            .unwrap_or(self.max_pixels_per_side as f64 * resolution);
        let mut constraints = PlanningConstraints::new(
            self.max_pixels_per_side,
            self.max_vertex_count,
            side,
            resolution,
        );
        constraints.max_iterations = self.max_iterations;
        constraints
    }
}

fn default_target_crs() -> String {
    "EPSG:3035".to_string()
}

fn default_resolution() -> f64 {
    100.0
}

fn default_max_pixels_per_side() -> u64 {
    3500
}

fn default_max_vertex_count() -> usize {
    1500
}

fn default_max_iterations() -> usize {
    100_000
}

/// Remote batch processor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_endpoint")]
    pub endpoint: String,
    /// Bearer token for the processor (loaded from environment only)
    #[serde(skip)]
    pub client_secret: Option<String>,
    #[serde(default = "default_output_layers")]
    pub output_layers: Vec<String>,
    #[serde(default = "default_time_margin_secs")]
    pub time_margin_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Use the in-process processor instead of the remote API
    #[serde(default)]
    pub mock: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_batch_endpoint(),
            client_secret: None,
            output_layers: default_output_layers(),
            time_margin_secs: default_time_margin_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            mock: false,
        }
    }
}

fn default_batch_endpoint() -> String {
    "http://localhost:9000/api/v1".to_string()
}

fn default_output_layers() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_time_margin_secs() -> i64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// STAC catalog used to find acquisition dates
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_catalog_url() -> String {
    "http://localhost:9001/stac".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_pages() -> usize {
    20
}

/// Downstream transformation service. Dispatch is disabled without a URL.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionsConfig {
    /// GeoJSON FeatureCollection of region polygons
    pub path: Option<PathBuf>,
    #[serde(default = "default_code_property")]
    pub code_property: String,
}

impl Default for RegionsConfig {
    fn default() -> Self {
        Self {
            path: None,
            code_property: default_code_property(),
        }
    }
}

fn default_code_property() -> String {
    "code".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.server.max_payload_bytes.as_u64(), 1024 * 1024);
        assert_eq!(config.storage.provider, StorageProvider::Local);
        assert_eq!(config.planner.target_crs, "EPSG:3035");
        assert_eq!(config.batch.time_margin_secs, 10);
        assert_eq!(config.batch.output_layers, vec!["default"]);
    }

    #[test]
    fn test_planner_constraints_derive_side() {
        let planner = PlannerConfig::default();
        let constraints = planner.constraints(None);
        assert_eq!(constraints.max_tile_side_meters, 350_000.0);
        assert_eq!(constraints.max_vertex_count, 1500);

        let finer = planner.constraints(Some(10.0));
        assert_eq!(finer.ground_resolution_meters, 10.0);
        assert_eq!(finer.max_tile_side_meters, 35_000.0);

        let fixed = PlannerConfig {
            max_tile_side_meters: Some(5_000.0),
            ..PlannerConfig::default()
        };
        assert_eq!(fixed.constraints(Some(10.0)).max_tile_side_meters, 5_000.0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[server]
max_payload_bytes = "2MB"

[storage]
provider = "memory"

[batch]
output_layers = ["B04", "B08"]
mock = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.max_payload_bytes.as_u64(), 2 * 1024 * 1024);
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.storage.provider, StorageProvider::Memory);
        assert_eq!(config.batch.output_layers, vec!["B04", "B08"]);
        assert!(config.batch.mock);
        assert_eq!(config.planner.max_iterations, 100_000);
    }
}
