//! Remote batch processor interface and its HTTP implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::BatchError;
use super::builder::ProcessingJob;
use crate::http::HttpClient;

pub type Result<T> = std::result::Result<T, BatchError>;

/// Native status report for one remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Submit a job. `Ok(None)` means the processor accepted the call but
    /// returned no job id.
    async fn submit(&self, job: &ProcessingJob) -> Result<Option<String>>;

    async fn start(&self, remote_id: &str) -> Result<()>;

    async fn stop(&self, remote_id: &str) -> Result<()>;

    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus>;

    async fn statuses(&self, remote_ids: &[String]) -> Result<Vec<RemoteJobStatus>>;
}

pub struct HttpBatchProcessor {
    client: HttpClient,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusList {
    #[serde(default)]
    data: Vec<RemoteJobStatus>,
}

impl HttpBatchProcessor {
    pub fn new(client: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/batch/process", self.endpoint)
    }

    fn job_url(&self, remote_id: &str) -> String {
        format!("{}/batch/process/{remote_id}", self.endpoint)
    }

    pub(crate) fn request_body(job: &ProcessingJob) -> serde_json::Value {
        let responses: Vec<_> = job
            .outputs
            .iter()
            .map(|o| json!({ "identifier": o.identifier, "format": { "type": o.format } }))
            .collect();

        json!({
            "processRequest": {
                "input": {
                    "bounds": {
                        "geometryRef": {
                            "key": job.package_key,
                            "featureId": job.feature_id,
                        },
                        "properties": { "crs": job.crs },
                    },
                    "data": [{
                        "type": job.dataset_id,
                        "dataFilter": {
                            "timeRange": {
                                "from": job.window.start.to_rfc3339(),
                                "to": job.window.end.to_rfc3339(),
                            }
                        }
                    }]
                },
                "output": {
                    "resolution": job.resolution,
                    "responses": responses,
                }
            },
            "output": { "artifactName": job.artifact_name },
        })
    }
}

#[async_trait]
impl BatchProcessor for HttpBatchProcessor {
    async fn submit(&self, job: &ProcessingJob) -> Result<Option<String>> {
        let body = Self::request_body(job);
        let response: SubmitResponse = self
            .client
            .send_json(Method::POST, &self.jobs_url(), &[], Some(&body))
            .await?;
        debug!(feature_id = job.feature_id, remote_id = ?response.id, "Submitted batch job");
        Ok(response.id.filter(|id| !id.trim().is_empty()))
    }

    async fn start(&self, remote_id: &str) -> Result<()> {
        let url = format!("{}/start", self.job_url(remote_id));
        self.client
            .send::<()>(Method::POST, &url, &[], None)
            .await?;
        info!(remote_id, "Started batch job");
        Ok(())
    }

    async fn stop(&self, remote_id: &str) -> Result<()> {
        let url = format!("{}/stop", self.job_url(remote_id));
        self.client
            .send::<()>(Method::POST, &url, &[], None)
            .await?;
        info!(remote_id, "Stopped batch job");
        Ok(())
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus> {
        Ok(self
            .client
            .send_json::<(), _>(Method::GET, &self.job_url(remote_id), &[], None)
            .await?)
    }

    async fn statuses(&self, remote_ids: &[String]) -> Result<Vec<RemoteJobStatus>> {
        if remote_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = [("ids", remote_ids.join(","))];
        let list: StatusList = self
            .client
            .send_json::<(), _>(Method::GET, &self.jobs_url(), &query, None)
            .await?;
        Ok(list.data)
    }
}

/// In-process processor for tests and offline runs. Records every call.
#[derive(Debug, Default)]
pub struct MockBatchProcessor {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    fail_artifacts: Vec<String>,
    missing_id_artifacts: Vec<String>,
    fail_stop: Vec<String>,
    statuses: HashMap<String, String>,
    submitted: Vec<(String, ProcessingJob)>,
    started: Vec<String>,
    stopped: Vec<String>,
}

impl MockBatchProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Submissions whose artifact name ends with `suffix` fail.
    pub fn fail_submissions_ending_with(&self, suffix: &str) {
        self.with_state(|s| s.fail_artifacts.push(suffix.to_string()));
    }

    /// Submissions whose artifact name ends with `suffix` return no id.
    pub fn omit_ids_ending_with(&self, suffix: &str) {
        self.with_state(|s| s.missing_id_artifacts.push(suffix.to_string()));
    }

    pub fn fail_stop_for(&self, remote_id: &str) {
        self.with_state(|s| s.fail_stop.push(remote_id.to_string()));
    }

    pub fn set_status(&self, remote_id: &str, status: &str) {
        self.with_state(|s| {
            s.statuses.insert(remote_id.to_string(), status.to_string());
        });
    }

    pub fn submitted(&self) -> Vec<(String, ProcessingJob)> {
        self.with_state(|s| s.submitted.clone())
    }

    pub fn started(&self) -> Vec<String> {
        self.with_state(|s| s.started.clone())
    }

    pub fn stopped(&self) -> Vec<String> {
        self.with_state(|s| s.stopped.clone())
    }
}

#[async_trait]
impl BatchProcessor for MockBatchProcessor {
    async fn submit(&self, job: &ProcessingJob) -> Result<Option<String>> {
        self.with_state(|s| {
            let matches = |list: &[String]| list.iter().any(|x| job.artifact_name.ends_with(x));
            if matches(&s.fail_artifacts) {
                return Err(BatchError::RemoteSubmissionFailed(format!(
                    "rejected {}",
                    job.artifact_name
                )));
            }
            if matches(&s.missing_id_artifacts) {
                return Ok(None);
            }
            s.next_id += 1;
            let id = format!("remote-{}", s.next_id);
            s.statuses.insert(id.clone(), "CREATED".to_string());
            s.submitted.push((id.clone(), job.clone()));
            Ok(Some(id))
        })
    }

    async fn start(&self, remote_id: &str) -> Result<()> {
        self.with_state(|s| {
            s.started.push(remote_id.to_string());
            s.statuses
                .insert(remote_id.to_string(), "ANALYSING".to_string());
        });
        Ok(())
    }

    async fn stop(&self, remote_id: &str) -> Result<()> {
        self.with_state(|s| {
            if s.fail_stop.iter().any(|id| id == remote_id) {
                return Err(BatchError::RemoteSubmissionFailed(format!(
                    "cannot stop {remote_id}"
                )));
            }
            s.stopped.push(remote_id.to_string());
            s.statuses.insert(remote_id.to_string(), "STOPPED".to_string());
            Ok(())
        })
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus> {
        self.with_state(|s| {
            s.statuses
                .get(remote_id)
                .map(|status| RemoteJobStatus {
                    id: remote_id.to_string(),
                    status: status.clone(),
                })
                .ok_or_else(|| BatchError::Decode(format!("unknown job {remote_id}")))
        })
    }

    async fn statuses(&self, remote_ids: &[String]) -> Result<Vec<RemoteJobStatus>> {
        self.with_state(|s| {
            Ok(remote_ids
                .iter()
                .filter_map(|id| {
                    s.statuses.get(id).map(|status| RemoteJobStatus {
                        id: id.clone(),
                        status: status.clone(),
                    })
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::builder::OutputSpec;
    use crate::catalog::AcquisitionWindow;
    use chrono::{TimeZone, Utc};

    fn job(artifact: &str) -> ProcessingJob {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ProcessingJob {
            feature_id: 7,
            window: AcquisitionWindow { start: ts, end: ts },
            package_key: "packages/abc.geojson".into(),
            artifact_name: artifact.into(),
            outputs: vec![OutputSpec {
                identifier: "default".into(),
                format: "image/tiff".into(),
            }],
            dataset_id: "sentinel-2-l2a".into(),
            crs: "EPSG:3035".into(),
            resolution: 100.0,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = HttpBatchProcessor::request_body(&job("artifacts/r/7_20240501T100000"));
        let input = &body["processRequest"]["input"];
        assert_eq!(input["bounds"]["geometryRef"]["featureId"], 7);
        assert_eq!(input["bounds"]["geometryRef"]["key"], "packages/abc.geojson");
        assert_eq!(input["bounds"]["properties"]["crs"], "EPSG:3035");
        assert_eq!(input["data"][0]["type"], "sentinel-2-l2a");
        assert_eq!(
            body["processRequest"]["output"]["responses"][0]["format"]["type"],
            "image/tiff"
        );
        assert_eq!(body["output"]["artifactName"], "artifacts/r/7_20240501T100000");
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let mock = MockBatchProcessor::new();
        let id = mock.submit(&job("a/1")).await.unwrap().unwrap();
        assert_eq!(mock.status(&id).await.unwrap().status, "CREATED");

        mock.start(&id).await.unwrap();
        assert_eq!(mock.started(), vec![id.clone()]);

        mock.stop(&id).await.unwrap();
        let all = mock.statuses(&[id.clone(), "ghost".into()]).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "STOPPED");
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let mock = MockBatchProcessor::new();
        mock.fail_submissions_ending_with("/bad");
        mock.omit_ids_ending_with("/anon");

        assert!(mock.submit(&job("x/bad")).await.is_err());
        assert_eq!(mock.submit(&job("x/anon")).await.unwrap(), None);
        assert!(mock.submit(&job("x/good")).await.unwrap().is_some());
        assert_eq!(mock.submitted().len(), 1);
    }
}
