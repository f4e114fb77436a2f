//! Downstream notification sink
//!
//! A finished parent task is handed to the transformation service as a flat
//! parameter list. The service answers with its own task id, which marks the
//! parent as dispatched.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{HttpClient, HttpError};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] HttpError),

    #[error("could not encode dataset list: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("notification service returned no task id")]
    MissingId,

    #[error("notification rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

/// One finished child, as the downstream service sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRequest {
    pub task_id: String,
    pub dataset_id: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchParams {
    pub task_id: String,
    pub owner_id: String,
    pub contact: String,
    pub callback_url: String,
    pub datasets: Vec<DatasetRequest>,
}

impl DispatchParams {
    /// Flatten into query parameters. The dataset list travels as a JSON
    /// string.
    pub fn to_query(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("TaskID", self.task_id.clone()),
            ("UserID", self.owner_id.clone()),
            ("Mail", self.contact.clone()),
            ("CallbackUrl", self.callback_url.clone()),
            ("DatasetRequests", serde_json::to_string(&self.datasets)?),
        ])
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Returns the downstream task id
    async fn dispatch(&self, params: &DispatchParams) -> Result<String>;
}

pub struct HttpNotificationSink {
    client: HttpClient,
    url: String,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    #[serde(default)]
    id: Option<String>,
}

impl HttpNotificationSink {
    pub fn new(client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn dispatch(&self, params: &DispatchParams) -> Result<String> {
        let query = params.to_query()?;
        let response: DispatchResponse = self
            .client
            .send_json::<(), _>(Method::GET, &self.url, &query, None)
            .await?;

        let id = response
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(NotifyError::MissingId)?;
        tracing::info!(task_id = %params.task_id, external_id = %id, "Dispatched task downstream");
        Ok(id)
    }
}

/// Sink for tests and offline runs
#[derive(Debug, Default)]
pub struct MockNotificationSink {
    sent: Mutex<Vec<DispatchParams>>,
    fail: bool,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<DispatchParams> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn dispatch(&self, params: &DispatchParams) -> Result<String> {
        if self.fail {
            return Err(NotifyError::Rejected("mock sink is failing".into()));
        }
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        sent.push(params.clone());
        tracing::info!(task_id = %params.task_id, "Mock dispatch");
        Ok(format!("external-{}", sent.len()))
    }
}
