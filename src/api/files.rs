//! Streaming file responses with single byte-range support, plus the static
//! frontend fallback.

use std::path::{Component, Path, PathBuf};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mime_guess::MimeGuess;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use super::error::{ApiError, ApiResult};

const INDEX_FILE: &str = "index.html";

/// How a streamed file is presented to the client.
#[derive(Debug, Clone, Copy)]
pub enum Disposition<'a> {
    Inline,
    Attachment(&'a str),
}

/// Streams `path`, honouring a single `Range` header. A missing file becomes
/// a 404 carrying `missing_message`.
pub async fn stream_file(
    path: &Path,
    headers: Option<&HeaderMap>,
    disposition: Disposition<'_>,
    missing_message: &str,
) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found(missing_message))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found(missing_message))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found(missing_message));
    }
    let size = metadata.len();

    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seeking file: {err}")))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length)))
                .into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Disposition::Attachment(filename) = disposition {
        headers.insert(header::CONTENT_DISPOSITION, attachment_header(filename));
    }
    Ok(response)
}

fn attachment_header(filename: &str) -> HeaderValue {
    let cleaned: String = filename
        .chars()
        .filter(|ch| ch.is_ascii_graphic() || *ch == ' ')
        .filter(|ch| !matches!(ch, '"' | '\\'))
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{cleaned}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Parses `bytes=start-end`, `bytes=start-` and `bytes=-suffix`.
pub fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let range = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    let (start, end) = range.split_once('-')?;

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = start.parse().ok()?;
    // A start past EOF is kept so the caller can answer 416.
    let end = if end.is_empty() {
        size.saturating_sub(1).max(start)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}

/// Serves a file from the frontend build, falling back to `index.html` for
/// extension-less paths so client-side routes resolve.
pub async fn serve_www_path(
    root: &Path,
    request_path: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let not_found = "File not found";
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => {
            stream_file(&root.join(INDEX_FILE), None, Disposition::Inline, not_found).await
        }
        Ok(_) => stream_file(&target, Some(headers), Disposition::Inline, not_found).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(&root.join(INDEX_FILE), None, Disposition::Inline, not_found).await
        }
        Err(_) => Err(ApiError::not_found(not_found)),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join(INDEX_FILE));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("File not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tempfile::tempdir;

    fn range(value: &str, size: u64) -> Option<(u64, u64)> {
        parse_range_header(&HeaderValue::from_str(value).unwrap(), size)
    }

    #[test]
    fn range_header_forms() {
        assert_eq!(range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(range("bytes=90-", 100), Some((90, 99)));
        assert_eq!(range("bytes=-10", 100), Some((90, 99)));
        assert_eq!(range("bytes=-500", 100), Some((0, 99)));
        assert_eq!(range("bytes=10-", 3), Some((10, 10)));
        assert_eq!(range("bytes=9-0", 100), None);
        assert_eq!(range("items=0-1", 100), None);
        assert_eq!(range("bytes=-0", 100), None);
    }

    #[tokio::test]
    async fn streams_partial_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));

        let response = stream_file(
            &path,
            Some(&headers),
            Disposition::Attachment("clip.mp4"),
            "gone",
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"clip.mp4\""
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"2345");
    }

    #[tokio::test]
    async fn unsatisfiable_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=10-"));
        let response = stream_file(&path, Some(&headers), Disposition::Inline, "gone")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */3");
    }

    #[tokio::test]
    async fn missing_file_uses_message() {
        let dir = tempdir().unwrap();
        let err = stream_file(&dir.path().join("nope"), None, Disposition::Inline, "gone")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "gone");
    }

    #[test]
    fn attachment_names_are_quoted_safely() {
        assert_eq!(
            attachment_header("a\"b\\c.mp4"),
            "attachment; filename=\"abc.mp4\""
        );
    }

    #[tokio::test]
    async fn www_paths_and_spa_fallback() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>app</html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let headers = HeaderMap::new();

        let js = serve_www_path(dir.path(), "/app.js", &headers).await.unwrap();
        assert_eq!(js.status(), StatusCode::OK);

        let route = serve_www_path(dir.path(), "/downloader", &headers)
            .await
            .unwrap();
        let body = to_bytes(route.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>app</html>");

        let missing = serve_www_path(dir.path(), "/missing.css", &headers)
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let escape = serve_www_path(dir.path(), "/../secret", &headers)
            .await
            .unwrap_err();
        assert_eq!(escape.status, StatusCode::NOT_FOUND);
    }
}
