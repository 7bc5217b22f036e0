use std::path::PathBuf;

use axum::{
    Json,
    extract::{
        Multipart, Path, State,
        multipart::{Field, MultipartError, MultipartRejection},
    },
    http::HeaderMap,
    response::Response,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::{
    AppState, Disposition,
    error::{ApiError, ApiResult},
    stream_file,
};
use crate::{
    compressor::{CompressError, CompressionLevel, find_compressed},
    security::{is_safe_path_segment, secure_filename},
};

const FALLBACK_UPLOAD_NAME: &str = "video";

#[derive(Debug, Serialize)]
pub(super) struct CompressResponse {
    success: bool,
    file_id: String,
    original_filename: String,
    original_size_mb: f64,
    compressed_size_mb: f64,
    compression_ratio: f64,
    download_url: String,
}

/// The uploaded video, kept alive with its scratch directory.
struct Upload {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

#[derive(Default)]
struct CompressForm {
    upload: Option<Upload>,
    empty_filename: bool,
    level: Option<String>,
    target_size: Option<String>,
}

pub(super) async fn compress_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<CompressResponse>> {
    let compressor = state
        .compressor
        .as_ref()
        .ok_or_else(|| ApiError::internal("Video compressor not available"))?;
    let multipart = multipart.map_err(|_| ApiError::bad_request("No video file provided"))?;
    let form = read_form(multipart).await?;

    let upload = match form.upload {
        Some(upload) => upload,
        None if form.empty_filename => return Err(ApiError::bad_request("No file selected")),
        None => return Err(ApiError::bad_request("No video file provided")),
    };
    let level = match form.level.as_deref().map(str::trim) {
        None | Some("") => CompressionLevel::default(),
        Some(value) => value
            .parse::<CompressionLevel>()
            .map_err(|err| ApiError::bad_request(err.to_string()))?,
    };
    // Unparseable or zero targets fall back to quality-based encoding.
    let target_size = form
        .target_size
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|mb| *mb > 0);

    let result = compressor
        .process_video(&upload.path, level, target_size)
        .await
        .map_err(|err| {
            if matches!(err, CompressError::InvalidLevel(_)) {
                ApiError::bad_request(err.to_string())
            } else {
                ApiError::internal(err.to_string())
            }
        })?;

    Ok(Json(CompressResponse {
        success: true,
        download_url: format!("/api/compressor/download/{}", result.file_id),
        file_id: result.file_id,
        original_filename: result.original_filename,
        original_size_mb: result.original_size_mb,
        compressed_size_mb: result.compressed_size_mb,
        compression_ratio: result.compression_ratio,
    }))
}

async fn read_form(mut multipart: Multipart) -> ApiResult<CompressForm> {
    let mut form = CompressForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(upload_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "video" if form.upload.is_none() => {
                let original = field.file_name().unwrap_or_default().to_string();
                if original.is_empty() {
                    form.empty_filename = true;
                    continue;
                }
                form.upload = Some(save_upload(field, &original).await?);
            }
            "compression_level" => form.level = Some(read_text(field).await?),
            "target_size" => form.target_size = Some(read_text(field).await?),
            _ => {}
        }
    }
    Ok(form)
}

// Keeps the multipart status, so an oversized body stays a 413.
fn upload_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), format!("Invalid upload: {}", err.body_text()))
}

async fn read_text(field: Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(upload_error)
}

async fn save_upload(mut field: Field<'_>, original: &str) -> ApiResult<Upload> {
    let dir = tempfile::Builder::new()
        .prefix("motherhen-upload-")
        .tempdir()
        .map_err(|err| ApiError::internal(format!("creating upload dir: {err}")))?;
    let mut name = secure_filename(original);
    if name.is_empty() {
        name = FALLBACK_UPLOAD_NAME.to_string();
    }
    let path = dir.path().join(name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| ApiError::internal(format!("saving upload: {err}")))?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(upload_error)?
    {
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::internal(format!("saving upload: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::internal(format!("saving upload: {err}")))?;
    Ok(Upload { _dir: dir, path })
}

pub(super) async fn download_compressed_video(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let not_found = "Video file not found";
    if !is_safe_path_segment(&file_id) {
        return Err(ApiError::not_found(not_found));
    }
    let Some(path) = find_compressed(&state.dirs.compressed, &file_id).await else {
        return Err(ApiError::not_found(not_found));
    };
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
