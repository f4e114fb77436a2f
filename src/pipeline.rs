//! Request submission: AOI to tiles to remote jobs to tracked tasks.

use geo::BoundingRect;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{BatchProcessor, BatchSpec, GeometryPackage, SubmittedJob, build_jobs, submit_all};
use crate::catalog::{AcquisitionWindow, CatalogError, CatalogQuery, TimeRange, acquisition_windows};
use crate::config::{BatchConfig, PlannerConfig};
use crate::ledger::TaskRegistry;
use crate::planner::{AoiError, AoiSource, AreaOfInterest, PlanError, plan};
use crate::regions::RegionCatalog;
use crate::storage::{StorageClient, StorageError};
use crate::tasks::{TaskError, TaskManager, TaskStatus};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Aoi(#[from] AoiError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("no acquisitions of '{dataset_id}' in the requested range")]
    NoAcquisitions { dataset_id: String },

    #[error("could not encode geometry package: {0}")]
    Package(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One bulk-download request as accepted over the API.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub dataset_id: String,
    pub aoi: AoiSource,
    pub time_range: TimeRange,
    /// Ground resolution in target CRS units; planner default when absent
    #[serde(default)]
    pub resolution: Option<f64>,
    #[serde(default)]
    pub target_crs: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJobSummary {
    pub feature_id: u32,
    pub artifact_name: String,
    pub window: AcquisitionWindow,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub request_id: String,
    pub group_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub package_key: String,
    pub tiles: usize,
    pub windows: usize,
    pub succeeded: Vec<SubmittedJob>,
    pub failed: Vec<FailedJobSummary>,
}

impl SubmissionOutcome {
    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Collaborators for one submission. Everything is borrowed.
pub struct Pipeline<'a> {
    pub regions: &'a RegionCatalog,
    pub catalog: &'a dyn CatalogQuery,
    pub processor: &'a dyn BatchProcessor,
    pub storage: &'a StorageClient,
    pub registry: &'a dyn TaskRegistry,
    pub planner: &'a PlannerConfig,
    pub batch: &'a BatchConfig,
    pub package_prefix: &'a str,
    pub artifact_prefix: &'a str,
}

impl Pipeline<'_> {
    pub async fn submit(&self, owner_id: &str, request: &DownloadRequest) -> Result<SubmissionOutcome> {
        if request.dataset_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("dataset_id is empty".into()));
        }
        let range = TimeRange::new(request.time_range.start, request.time_range.end)?;
        let request_id = Uuid::new_v4().simple().to_string();
        let group_id = Uuid::new_v4().simple().to_string();

        let aoi = AreaOfInterest::resolve(&request.aoi, self.regions)?;
        let target_crs = request
            .target_crs
            .as_deref()
            .unwrap_or(&self.planner.target_crs);
        let constraints = self.planner.constraints(request.resolution);
        let tiles = plan(&aoi, target_crs, &constraints)?;

        let bounds = aoi.geometry().bounding_rect().ok_or(PlanError::EmptyAoi)?;
        let bbox = [bounds.min().x, bounds.min().y, bounds.max().x, bounds.max().y];
        let scenes = self
            .catalog
            .search(&request.dataset_id, bbox, &range)
            .await?;
        let windows = acquisition_windows(&scenes);
        if windows.is_empty() {
            return Err(PipelineError::NoAcquisitions {
                dataset_id: request.dataset_id.clone(),
            });
        }

        let package = GeometryPackage::from_tiles(self.package_prefix, &tiles);
        self.storage.upload(&package.key, package.to_bytes()?).await?;

        let spec = BatchSpec {
            request_id: request_id.clone(),
            dataset_id: request.dataset_id.clone(),
            resolution: constraints.ground_resolution_meters,
            output_layers: self.batch.output_layers.clone(),
            time_margin_secs: self.batch.time_margin_secs,
            artifact_prefix: self.artifact_prefix.to_string(),
        };
        let jobs = build_jobs(&package, &windows, &spec);
        info!(
            %request_id,
            tiles = tiles.len(),
            windows = windows.len(),
            jobs = jobs.len(),
            "Submitting batch jobs"
        );
        let report = submit_all(self.processor, jobs).await;

        let manager = TaskManager::new(self.registry, self.processor, self.storage);
        let mut child_ids = Vec::with_capacity(report.succeeded.len());
        for submitted in &report.succeeded {
            if let Some(child_id) = manager.create_child(&group_id, owner_id, submitted)? {
                child_ids.push(child_id);
            }
        }

        let (task_id, status) = if child_ids.is_empty() {
            if let Err(e) = self.storage.delete(&package.key).await {
                warn!(key = %package.key, error = %e, "Failed to delete unused package");
            }
            let message = format!("all {} job submissions failed", report.attempted());
            let id = manager.create_rejected(&group_id, owner_id, &request.dataset_id, &message)?;
            (id, TaskStatus::Rejected)
        } else {
            let id = manager.create_parent(
                &group_id,
                owner_id,
                &request.dataset_id,
                &child_ids,
                std::slice::from_ref(&package.key),
            )?;
            (id, TaskStatus::Queued)
        };

        let failed = report
            .failed
            .iter()
            .map(|f| FailedJobSummary {
                feature_id: f.job.feature_id,
                artifact_name: f.job.artifact_name.clone(),
                window: f.job.window,
                error: f.error.to_string(),
            })
            .collect();

        info!(
            %request_id,
            %task_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Request submitted"
        );
        Ok(SubmissionOutcome {
            request_id,
            group_id,
            task_id,
            status,
            package_key: package.key,
            tiles: tiles.len(),
            windows: windows.len(),
            succeeded: report.succeeded,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MockBatchProcessor;
    use crate::catalog::{CatalogFeature, StaticCatalog};
    use crate::ledger::FjallRegistry;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        regions: RegionCatalog,
        catalog: StaticCatalog,
        processor: MockBatchProcessor,
        storage: StorageClient,
        registry: FjallRegistry,
        planner: PlannerConfig,
        batch: BatchConfig,
        _temp: TempDir,
    }

    impl Fixture {
        /// Degree-based planner so a 3x1 degree box gives exactly 3 tiles.
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let scene = |day| CatalogFeature {
                timestamp: Utc.with_ymd_and_hms(2024, 5, day, 10, 0, 0).unwrap(),
                bbox: None,
            };
            Self {
                regions: RegionCatalog::default(),
                catalog: StaticCatalog::new(vec![scene(1), scene(2)]),
                processor: MockBatchProcessor::new(),
                storage: StorageClient::in_memory(),
                registry: FjallRegistry::open(temp.path().join("registry")).unwrap(),
                planner: PlannerConfig {
                    target_crs: "EPSG:4326".into(),
                    resolution_meters: 0.01,
                    max_pixels_per_side: 100,
                    max_vertex_count: 0,
                    max_tile_side_meters: Some(1.0),
                    ..PlannerConfig::default()
                },
                batch: BatchConfig::default(),
                _temp: temp,
            }
        }

        fn pipeline(&self) -> Pipeline<'_> {
            Pipeline {
                regions: &self.regions,
                catalog: &self.catalog,
                processor: &self.processor,
                storage: &self.storage,
                registry: &self.registry,
                planner: &self.planner,
                batch: &self.batch,
                package_prefix: "packages",
                artifact_prefix: "artifacts",
            }
        }
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            dataset_id: "sentinel-2-l2a".into(),
            aoi: AoiSource::Bbox([0.0, 0.0, 3.0, 1.0]),
            time_range: TimeRange {
                start: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap(),
            },
            resolution: None,
            target_crs: None,
        }
    }

    #[tokio::test]
    async fn test_partial_submission() {
        let fx = Fixture::new();
        fx.processor
            .fail_submissions_ending_with("/3_20240502T100000");

        let outcome = fx.pipeline().submit("alice", &request()).await.unwrap();
        assert_eq!(outcome.tiles, 3);
        assert_eq!(outcome.windows, 2);
        assert_eq!(outcome.succeeded.len(), 5);
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.is_partial());
        assert_eq!(outcome.failed[0].feature_id, 3);
        assert_eq!(outcome.status, TaskStatus::Queued);

        let parent = fx.registry.get(&outcome.task_id).unwrap().unwrap();
        assert_eq!(parent.remote_job_ids.len(), 5);
        assert_eq!(parent.artifact_names.len(), 6);
        assert!(parent.artifact_names.contains(&outcome.package_key));
        assert!(fx.storage.exists(&outcome.package_key).await.unwrap());
        assert_eq!(fx.registry.count().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_jobs_carry_widened_windows() {
        let fx = Fixture::new();
        let outcome = fx.pipeline().submit("alice", &request()).await.unwrap();

        let first = &outcome.succeeded[0].job;
        assert_eq!(first.window.end - first.window.start, chrono::Duration::seconds(20));
        assert_eq!(first.package_key, outcome.package_key);
        assert!(first.artifact_name.starts_with(&format!("artifacts/{}/", outcome.request_id)));
    }

    #[tokio::test]
    async fn test_all_failed_records_rejection() {
        let fx = Fixture::new();
        fx.processor.fail_submissions_ending_with("T100000");

        let outcome = fx.pipeline().submit("alice", &request()).await.unwrap();
        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed.len(), 6);
        assert_eq!(outcome.status, TaskStatus::Rejected);

        let task = fx.registry.get(&outcome.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Rejected);
        assert!(!fx.storage.exists(&outcome.package_key).await.unwrap());
        assert_eq!(fx.registry.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_ids_are_failures() {
        let fx = Fixture::new();
        fx.processor.omit_ids_ending_with("/1_20240501T100000");

        let outcome = fx.pipeline().submit("alice", &request()).await.unwrap();
        assert_eq!(outcome.succeeded.len(), 5);
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].error.contains("no id"));
    }

    #[tokio::test]
    async fn test_request_level_failures() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline();

        let mut unknown_region = request();
        unknown_region.aoi = AoiSource::Region("XX".into());
        assert!(matches!(
            pipeline.submit("alice", &unknown_region).await,
            Err(PipelineError::Aoi(AoiError::RegionNotFound(_)))
        ));

        let mut empty_range = request();
        empty_range.time_range.start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        empty_range.time_range.end = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        assert!(matches!(
            pipeline.submit("alice", &empty_range).await,
            Err(PipelineError::NoAcquisitions { .. })
        ));

        let mut reversed = request();
        std::mem::swap(&mut reversed.time_range.start, &mut reversed.time_range.end);
        assert!(matches!(
            pipeline.submit("alice", &reversed).await,
            Err(PipelineError::Catalog(CatalogError::InvalidTimeRange { .. }))
        ));

        let mut bad_crs = request();
        bad_crs.target_crs = Some("EPSG:999999".into());
        assert!(matches!(
            pipeline.submit("alice", &bad_crs).await,
            Err(PipelineError::Plan(PlanError::Geometry(_)))
        ));

        assert!(fx.processor.submitted().is_empty());
        assert_eq!(fx.registry.count().unwrap(), 0);
    }
}
