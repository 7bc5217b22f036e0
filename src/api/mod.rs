#![forbid(unsafe_code)]

//! HTTP surface: one router for the scraper, compressor and downloader, plus
//! a health probe and the static frontend.

mod compress;
mod download;
mod error;
mod files;
mod scrape;

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::Request,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Serialize, de::DeserializeOwned};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use tracing::{info, warn};

use crate::{
    compressor::{Toolchain, VideoCompressor},
    config::RuntimeConfig,
    downloader::{DownloadManager, check_available},
    scraper::WebScraper,
};

pub use error::{ApiError, ApiResult};
pub use files::{Disposition, parse_range_header, serve_www_path, stream_file};

/// Directories handlers read from even when their module is unavailable.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub scraped: PathBuf,
    pub compressed: PathBuf,
    pub downloads: PathBuf,
    pub www_root: PathBuf,
}

impl DataDirs {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            scraped: config.scraped_dir(),
            compressed: config.compressed_dir(),
            downloads: config.downloads_dir(),
            www_root: config.www_root.clone(),
        }
    }
}

/// Shared state injected into every handler. A `None` service answers its
/// endpoints with "not available".
#[derive(Clone)]
pub struct AppState {
    pub scraper: Option<WebScraper>,
    pub compressor: Option<VideoCompressor>,
    pub downloader: Option<DownloadManager>,
    pub dirs: Arc<DataDirs>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModuleStatus {
    pub scraper: bool,
    pub compressor: bool,
    pub downloader: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    modules: ModuleStatus,
}

impl AppState {
    /// Builds every service whose external dependency is usable. A module
    /// that fails its check is left out and logged.
    pub async fn probe(config: &RuntimeConfig) -> Self {
        let scraper = match WebScraper::new(
            config.scraped_dir(),
            config.scrape_delay(),
            config.scrape_retries,
        ) {
            Ok(scraper) => Some(scraper),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "web scraper unavailable");
                None
            }
        };

        let toolchain = Toolchain::resolve(&config.tools_dir);
        let compressor = match toolchain.check().await {
            Ok(()) => Some(VideoCompressor::new(
                toolchain,
                config.compressed_dir(),
                config.max_concurrent_compressions,
            )),
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    "video compressor unavailable; run `ffmpeg_setup install`"
                );
                None
            }
        };

        let downloader = match check_available(&config.ytdlp_bin).await {
            Ok(version) => {
                info!(version, "found yt-dlp");
                Some(DownloadManager::new(
                    config.downloads_dir(),
                    config.ytdlp_bin.clone(),
                ))
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "video downloader unavailable");
                None
            }
        };

        Self {
            scraper,
            compressor,
            downloader,
            dirs: Arc::new(DataDirs::from_config(config)),
        }
    }

    pub fn modules(&self) -> ModuleStatus {
        ModuleStatus {
            scraper: self.scraper.is_some(),
            compressor: self.compressor.is_some(),
            downloader: self.downloader.is_some(),
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scraper/scrape", post(scrape::scrape_website))
        .route(
            "/api/scraper/download/{filename}",
            get(scrape::download_scraped_file),
        )
        .route("/api/compressor/compress", post(compress::compress_video))
        .route(
            "/api/compressor/download/{file_id}",
            get(compress::download_compressed_video),
        )
        .route("/api/downloader/download", post(download::start_download))
        .route("/api/downloader/downloads", get(download::list_downloads))
        .route(
            "/api/downloader/download/{id}",
            get(download::download_file),
        )
        .route(
            "/api/downloader/downloads/{id}",
            delete(download::delete_download),
        )
        .fallback(static_fallback)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        modules: state.modules(),
    })
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("Endpoint not found").into_response();
    }
    match serve_www_path(&state.dirs.www_root, path, req.headers()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Decodes a JSON request body; an empty body decodes as the default value.
fn parse_json_body<T: DeserializeOwned + Default>(body: &[u8]) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))
}
