//! /v1/build, /v1/upload, DELETE /v1/build/{id}

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use foundry_core::id::is_valid_job_id;
use foundry_core::RawBuildRequest;

use super::BuilderState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct JobAccepted {
    pub id: String,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Build request headers, untouched.
pub fn raw_request(headers: &HeaderMap) -> RawBuildRequest {
    RawBuildRequest {
        targets: headers
            .get_all("x-targets")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect(),
        platform: header(headers, "x-platform"),
        archive: header(headers, "x-file"),
        compression_level: header(headers, "x-zstd-compression-level"),
    }
}

// ── POST /v1/build ────────────────────────────────────────────────────────────

/// Admission runs in its own task so that a client disconnect, which drops
/// this handler, only cancels the token and never a store or queue call
/// already in flight.
pub async fn handle_build(
    State(state): State<BuilderState>,
    headers: HeaderMap,
) -> Result<Json<JobAccepted>, ApiError> {
    let raw = raw_request(&headers);
    let cancel = CancellationToken::new();
    let abort_on_drop = cancel.clone().drop_guard();

    let controller = state.controller.clone();
    let admission = tokio::spawn(async move { controller.admit(raw, &cancel).await });
    let result = admission.await;
    abort_on_drop.disarm();

    match result {
        Ok(Ok(id)) => Ok(Json(JobAccepted { id })),
        Ok(Err(e)) => {
            let e = ApiError::from(e);
            if e.status.is_server_error() {
                tracing::error!(error = %e.message, "build request failed");
            }
            Err(e)
        }
        Err(e) => {
            tracing::error!(error = %e, "admission task failed");
            Err(ApiError::internal("internal server error"))
        }
    }
}

// ── DELETE /v1/build/{id} ─────────────────────────────────────────────────────

/// The client fetched every artifact; the job's directories can go.
pub async fn handle_cleanup(
    State(state): State<BuilderState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !is_valid_job_id(&id) {
        return Err(ApiError::bad_request("invalid job id"));
    }
    if state.controller.cleanup(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown job {id}")))
    }
}
