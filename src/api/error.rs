use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;
use tracing::error;

use super::models::ErrorResponse;
use crate::catalog::CatalogError;
use crate::geometry::GeometryError;
use crate::ledger::RegistryError;
use crate::pipeline::PipelineError;
use crate::planner::{AoiError, PlanError};
use crate::tasks::TaskError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("request cannot be satisfied: {0}")]
    Unsatisfiable(String),
    #[error("upstream service failed: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidTransition(_) | ApiError::NotReady(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unsatisfiable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PermissionDenied(_) => "PERMISSION_DENIED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InvalidTransition(_) => "INVALID_TRANSITION",
            ApiError::NotReady(_) => "NOT_READY",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Unsatisfiable(_) => "UNSATISFIABLE",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::StaleStatus { .. } => ApiError::InvalidTransition(value.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(value: TaskError) -> Self {
        let message = value.to_string();
        match value {
            TaskError::NotFound(_) => ApiError::NotFound(message),
            TaskError::PermissionDenied { .. } => ApiError::PermissionDenied(message),
            TaskError::InvalidTransition { .. } => ApiError::InvalidTransition(message),
            TaskError::InvalidField { .. } => ApiError::InvalidPayload(message),
            TaskError::NotReady { .. } => ApiError::NotReady(message),
            TaskError::Remote(_) | TaskError::Notify(_) => ApiError::Upstream(message),
            TaskError::Registry(inner) => inner.into(),
            TaskError::IdAllocationExhausted(_) => ApiError::Internal(message),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        let message = value.to_string();
        match value {
            PipelineError::InvalidRequest(_) => ApiError::InvalidPayload(message),
            PipelineError::Aoi(AoiError::InvalidBoundingBox { .. }) => {
                ApiError::InvalidPayload(message)
            }
            PipelineError::Aoi(AoiError::RegionNotFound(_)) => ApiError::NotFound(message),
            PipelineError::Plan(PlanError::InvalidConstraints(_))
            | PipelineError::Plan(PlanError::Geometry(GeometryError::UnsupportedCrs(_))) => {
                ApiError::InvalidPayload(message)
            }
            PipelineError::Plan(_) | PipelineError::NoAcquisitions { .. } => {
                ApiError::Unsatisfiable(message)
            }
            PipelineError::Catalog(CatalogError::InvalidTimeRange { .. }) => {
                ApiError::InvalidPayload(message)
            }
            PipelineError::Catalog(_) | PipelineError::Storage(_) => ApiError::Upstream(message),
            PipelineError::Package(_) => ApiError::Internal(message),
            PipelineError::Task(e) => e.into(),
        }
    }
}
