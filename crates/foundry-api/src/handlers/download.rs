//! GET /v1/download/{id}/{*path} — stream an artifact from a job's out dir.

use std::path::{Component, Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use foundry_core::id::is_valid_job_id;

use super::BuilderState;
use crate::error::ApiError;

/// Resolve `path` under `out_dir`, refusing anything that could escape it.
fn artifact_path(out_dir: &FsPath, path: &str) -> Option<PathBuf> {
    let relative = FsPath::new(path);
    if path.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(out_dir.join(relative))
}

pub async fn handle_download(
    State(state): State<BuilderState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !is_valid_job_id(&id) {
        return Err(ApiError::bad_request("invalid job id"));
    }
    let out_dir = state.controller.job_dirs(&id).out_dir();
    let file_path = artifact_path(&out_dir, &path).ok_or_else(|| ApiError::bad_request("invalid path"))?;

    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|_| ApiError::not_found(format!("{path} not found")))?;
    let meta = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !meta.is_file() {
        return Err(ApiError::not_found(format!("{path} not found")));
    }

    tracing::debug!(job_id = %id, file = %path, bytes = meta.len(), "serving artifact");
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, meta.len().to_string()),
        ],
        body,
    )
        .into_response())
}
