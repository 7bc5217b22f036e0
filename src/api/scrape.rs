use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use serde::{Deserialize, Serialize};

use super::{
    AppState, Disposition, parse_json_body, stream_file,
    error::{ApiError, ApiResult},
};
use crate::{
    scraper::{OutputFormat, ScrapeError, is_valid_url},
    security::secure_filename,
};

#[derive(Debug, Default, Deserialize)]
pub(super) struct ScrapeRequest {
    url: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct ScrapeResponse {
    success: bool,
    filepath: String,
    filename: String,
    format: String,
}

pub(super) async fn scrape_website(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ScrapeResponse>> {
    let scraper = state
        .scraper
        .as_ref()
        .ok_or_else(|| ApiError::internal("Web scraper not available"))?;
    let request: ScrapeRequest = parse_json_body(&body)?;
    let url = request
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;
    if !is_valid_url(&url) {
        return Err(ApiError::bad_request("Invalid URL format"));
    }
    let format = request.format.unwrap_or_else(|| "json".to_string());

    let outcome = scraper
        .scrape(&url, OutputFormat::from_request(&format))
        .await
        .map_err(|err| {
            if matches!(err, ScrapeError::Task(_)) {
                ApiError::internal(err.to_string())
            } else {
                ApiError::bad_request(err.to_string())
            }
        })?;
    Ok(Json(ScrapeResponse {
        success: true,
        filepath: outcome.filepath.to_string_lossy().into_owned(),
        filename: outcome.file_info.filename,
        format,
    }))
}

pub(super) async fn download_scraped_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let safe = secure_filename(&filename);
    if safe.is_empty() {
        return Err(ApiError::not_found("File not found"));
    }
    let path = state.dirs.scraped.join(&safe);
    stream_file(
        &path,
        Some(&headers),
        Disposition::Attachment(&safe),
        "File not found",
    )
    .await
}
