use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::info;

use super::{
    models::{HealthResponse, ListQuery, RemoveResponse},
    state::AppState,
    utils::{require_json, user_id, validate_body_size},
    validation::validate_request,
};
use crate::api::error::ApiError;
use crate::ledger::UnitOfWork;
use crate::pipeline::DownloadRequest;
use crate::tasks::{DispatchRequest, TaskStatus};

/// Reads a JSON body within the configured payload limit.
///
/// Compressed bodies are already inflated by `RequestDecompressionLayer`,
/// so the limit applies to the decoded size.
async fn read_json<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<T, ApiError> {
    require_json(headers)?;
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::InvalidPayload(err.to_string()))?
        .to_bytes();
    validate_body_size(&data, state.config.server.max_payload_bytes.as_usize())?;
    Ok(serde_json::from_slice(&data)?)
}

/// Bulk-download intake (POST /requests)
///
/// Plans tiles for the area of interest, looks up acquisitions, uploads the
/// geometry package and submits one remote job per tile and window. All
/// registry writes are held in a unit of work and committed only when the
/// pipeline returns successfully.
///
/// Responds 202 with the parent task id and the per-job outcome. When some
/// jobs fail the response still carries both lists; when every job fails
/// the registered task is `Rejected`.
pub async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let request: DownloadRequest = read_json(&state, &headers, body).await?;
    validate_request(&request).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    let unit = UnitOfWork::new(state.registry.as_ref());
    let outcome = match state.pipeline(&unit).submit(&owner, &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.metrics.request_rejected();
            return Err(e.into());
        }
    };
    let writes = unit.commit()?;

    state.metrics.tiles_planned(outcome.tiles);
    state.metrics.jobs_submitted(outcome.succeeded.len());
    state.metrics.jobs_failed(outcome.failed.len());
    if outcome.status == TaskStatus::Rejected {
        state.metrics.request_rejected();
    } else {
        state.metrics.request_accepted();
    }
    info!(
        task_id = %outcome.task_id,
        owner = %owner,
        status = %outcome.status,
        partial = outcome.is_partial(),
        writes,
        "Download request registered"
    );

    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// GET /tasks?status=
pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::InvalidPayload)?;

    let tasks = state.tasks(state.registry.as_ref()).list(&owner, status)?;
    Ok(Json(tasks))
}

/// GET /tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let task = state.tasks(state.registry.as_ref()).get(&task_id, &owner)?;
    Ok(Json(task))
}

/// POST /tasks/{task_id}/cancel
///
/// Cancelling an undispatched parent also stops its remote jobs, deletes
/// its artifacts and removes its children. Individual cleanup failures are
/// reported in the body, not raised.
pub async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let unit = UnitOfWork::new(state.registry.as_ref());
    let outcome = state.tasks(&unit).cancel(&task_id, &owner).await?;
    unit.commit()?;

    if !outcome.already_cancelled {
        state.metrics.task_cancelled();
    }
    Ok(Json(outcome))
}

/// POST /tasks/{task_id}/sync
///
/// Pulls remote job statuses into the children and re-aggregates the parent.
pub async fn sync_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let unit = UnitOfWork::new(state.registry.as_ref());
    let manager = state.tasks(&unit);
    manager.get(&task_id, &owner)?;
    let report = manager.sync_group(&task_id).await?;
    unit.commit()?;
    Ok(Json(report))
}

/// POST /tasks/{task_id}/dispatch
pub async fn dispatch_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let request: DispatchRequest = read_json(&state, &headers, body).await?;
    let sink = state
        .notifier
        .clone()
        .ok_or_else(|| ApiError::Upstream("notification service is not configured".into()))?;

    let unit = UnitOfWork::new(state.registry.as_ref());
    let manager = state.tasks(&unit);
    manager.get(&task_id, &owner)?;
    let outcome = manager.dispatch(&task_id, sink.as_ref(), &request).await?;
    unit.commit()?;
    Ok(Json(outcome))
}

/// DELETE /tasks/{task_id}
pub async fn delete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = user_id(&headers)?;
    let unit = UnitOfWork::new(state.registry.as_ref());
    let removed = state.tasks(&unit).remove(&task_id, &owner)?;
    unit.commit()?;
    Ok(Json(RemoveResponse { removed }))
}

/// PATCH /tasks/{task_id}
///
/// Status callback from the downstream services. Only the whitelisted
/// fields are accepted.
pub async fn patch_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let fields: Map<String, Value> = read_json(&state, &headers, body).await?;
    let unit = UnitOfWork::new(state.registry.as_ref());
    let task = state.tasks(&unit).patch_status(&task_id, &fields)?;
    unit.commit()?;
    Ok(Json(task))
}

/// PATCH /tasks
///
/// Body maps task ids to field objects. Per-task failures are collected in
/// the report; the successful updates are committed together.
pub async fn patch_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let updates: Map<String, Value> = read_json(&state, &headers, body).await?;
    let unit = UnitOfWork::new(state.registry.as_ref());
    let report = state.tasks(&unit).patch_status_multiple(&updates);
    unit.commit()?;
    Ok(Json(report))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        regions: state.regions.len(),
        metrics: state.metrics.snapshot(),
    })
}
