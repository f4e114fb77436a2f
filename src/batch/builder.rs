use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::package::GeometryPackage;
use crate::catalog::AcquisitionWindow;

pub const RASTER_FORMAT: &str = "image/tiff";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub identifier: String,
    pub format: String,
}

/// Per-request inputs to job construction.
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub request_id: String,
    pub dataset_id: String,
    pub resolution: f64,
    pub output_layers: Vec<String>,
    pub time_margin_secs: i64,
    pub artifact_prefix: String,
}

/// One remote job: a package feature over one widened acquisition window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingJob {
    pub feature_id: u32,
    pub window: AcquisitionWindow,
    pub package_key: String,
    pub artifact_name: String,
    pub outputs: Vec<OutputSpec>,
    pub dataset_id: String,
    pub crs: String,
    pub resolution: f64,
}

/// One job per (window, tile), windows outermost.
pub fn build_jobs(
    package: &GeometryPackage,
    windows: &[AcquisitionWindow],
    spec: &BatchSpec,
) -> Vec<ProcessingJob> {
    let margin = Duration::seconds(spec.time_margin_secs);
    let outputs: Vec<OutputSpec> = spec
        .output_layers
        .iter()
        .map(|layer| OutputSpec {
            identifier: layer.clone(),
            format: RASTER_FORMAT.to_string(),
        })
        .collect();
    let prefix = spec.artifact_prefix.trim_end_matches('/');

    let mut jobs = Vec::with_capacity(windows.len() * package.len());
    for window in windows {
        let stamp = window.start.format("%Y%m%dT%H%M%S");
        let widened = AcquisitionWindow {
            start: window.start - margin,
            end: window.end + margin,
        };
        for feature in &package.features {
            jobs.push(ProcessingJob {
                feature_id: feature.feature_id,
                window: widened,
                package_key: package.key.clone(),
                artifact_name: format!(
                    "{prefix}/{}/{}_{stamp}",
                    spec.request_id, feature.feature_id
                ),
                outputs: outputs.clone(),
                dataset_id: spec.dataset_id.clone(),
                crs: package.crs.clone(),
                resolution: spec.resolution,
            });
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Tile;
    use chrono::{TimeZone, Utc};
    use geo::MultiPolygon;

    fn tiles(n: usize) -> Vec<Tile> {
        (0..n)
            .map(|i| Tile {
                bbox: [i as f64, 0.0, i as f64 + 1.0, 1.0],
                bbox_crs: "EPSG:32633".into(),
                width_px: 1,
                height_px: 1,
                clip_geometry: MultiPolygon(Vec::new()),
            })
            .collect()
    }

    fn spec() -> BatchSpec {
        BatchSpec {
            request_id: "req-1".into(),
            dataset_id: "sentinel-2-l2a".into(),
            resolution: 10.0,
            output_layers: vec!["B04".into(), "B08".into()],
            time_margin_secs: 10,
            artifact_prefix: "artifacts/".into(),
        }
    }

    fn window(day: u32) -> AcquisitionWindow {
        AcquisitionWindow {
            start: Utc.with_ymd_and_hms(2024, 5, day, 10, 20, 30).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, day, 10, 25, 0).unwrap(),
        }
    }

    #[test]
    fn test_one_job_per_window_and_tile() {
        let package = GeometryPackage::from_tiles("packages", &tiles(3));
        let jobs = build_jobs(&package, &[window(1), window(2)], &spec());

        assert_eq!(jobs.len(), 6);
        let pairs: Vec<(u32, u32)> = jobs
            .iter()
            .map(|j| (j.window.start.format("%d").to_string().parse().unwrap(), j.feature_id))
            .collect();
        assert_eq!(pairs, vec![(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
        assert!(jobs.iter().all(|j| j.package_key == package.key));
        assert!(jobs.iter().all(|j| j.crs == "EPSG:32633"));
    }

    #[test]
    fn test_window_is_widened_symmetrically() {
        let package = GeometryPackage::from_tiles("packages", &tiles(1));
        let jobs = build_jobs(&package, &[window(1)], &spec());

        assert_eq!(
            jobs[0].window.start,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 20).unwrap()
        );
        assert_eq!(
            jobs[0].window.end,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 25, 10).unwrap()
        );
    }

    #[test]
    fn test_outputs_and_artifact_name() {
        let package = GeometryPackage::from_tiles("packages", &tiles(2));
        let jobs = build_jobs(&package, &[window(3)], &spec());

        let job = &jobs[1];
        assert_eq!(job.artifact_name, "artifacts/req-1/2_20240503T102030");
        assert_eq!(job.outputs.len(), 2);
        assert_eq!(job.outputs[0].identifier, "B04");
        assert!(job.outputs.iter().all(|o| o.format == "image/tiff"));
    }

    #[test]
    fn test_no_windows_no_jobs() {
        let package = GeometryPackage::from_tiles("packages", &tiles(2));
        assert!(build_jobs(&package, &[], &spec()).is_empty());
    }
}
