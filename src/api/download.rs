use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    AppState, Disposition, parse_json_body, stream_file,
    error::{ApiError, ApiResult},
};
use crate::{
    downloader::{DownloadRecord, DownloadRequest},
    security::is_safe_path_segment,
};

#[derive(Debug, Default, Deserialize)]
pub(super) struct StartDownloadRequest {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct StartDownloadResponse {
    success: bool,
    download_id: String,
}

pub(super) async fn start_download(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<StartDownloadResponse>> {
    let downloader = state.downloader.as_ref().ok_or_else(|| {
        ApiError::internal("Video downloader not available (yt-dlp not installed)")
    })?;
    let request: StartDownloadRequest = parse_json_body(&body)?;
    let url = request
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let download_id = downloader.start(DownloadRequest {
        url,
        format: request.format,
        quality: request.quality,
    });
    Ok(Json(StartDownloadResponse {
        success: true,
        download_id,
    }))
}

pub(super) async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadRecord>> {
    Json(
        state
            .downloader
            .as_ref()
            .map(|downloader| downloader.list())
            .unwrap_or_default(),
    )
}

pub(super) async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let not_found = "File not found";
    let downloader = state
        .downloader
        .as_ref()
        .ok_or_else(|| ApiError::not_found(not_found))?;
    if !is_safe_path_segment(&id) {
        return Err(ApiError::not_found(not_found));
    }
    let path = downloader
        .find_file(&id)
        .await
        .ok_or_else(|| ApiError::not_found(not_found))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    stream_file(
        &path,
        Some(&headers),
        Disposition::Attachment(&filename),
        not_found,
    )
    .await
}

pub(super) async fn delete_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let not_found = || ApiError::not_found("Download not found");
    let downloader = state.downloader.as_ref().ok_or_else(not_found)?;
    if !is_safe_path_segment(&id) {
        return Err(not_found());
    }
    let removed = downloader
        .delete(&id)
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    if removed {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(not_found())
    }
}
