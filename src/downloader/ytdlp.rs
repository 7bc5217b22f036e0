use std::{ffi::OsString, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Printed by yt-dlp once per progress tick; parsed by [`parse_progress_line`].
const PROGRESS_TEMPLATE: &str = "download:progress:%(progress.status)s:%(progress.downloaded_bytes)s:%(progress.total_bytes)s:%(progress.total_bytes_estimate)s";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    /// `mp3` selects audio extraction, anything else downloads video.
    pub fn from_request(value: &str) -> Self {
        if value.eq_ignore_ascii_case("mp3") {
            Self::Audio
        } else {
            Self::Video
        }
    }
}

pub fn audio_bitrate(quality: &str) -> &'static str {
    match quality {
        "low" => "128K",
        "high" => "320K",
        _ => "192K",
    }
}

pub fn video_format(quality: &str) -> &'static str {
    match quality {
        "high" => "best[ext=mp4]/best",
        "low" => "best[height<=480][ext=mp4]/best[height<=480]",
        _ => "best[height<=720][ext=mp4]/best[height<=720]",
    }
}

/// Full yt-dlp command line for one download into `download_dir`.
pub fn download_args(
    download_dir: &Path,
    id: &str,
    url: &str,
    format: MediaFormat,
    quality: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-o".into(),
        download_dir.join(format!("{id}.%(ext)s")).into(),
    ];
    args.extend(
        [
            "--no-playlist",
            "--socket-timeout",
            "30",
            "--no-check-certificates",
            "--geo-bypass",
            "--retries",
            "5",
            "--newline",
            "--write-info-json",
            "--progress-template",
            PROGRESS_TEMPLATE,
        ]
        .map(OsString::from),
    );
    match format {
        MediaFormat::Audio => args.extend(
            [
                "-f",
                "bestaudio/best",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                audio_bitrate(quality),
            ]
            .map(OsString::from),
        ),
        MediaFormat::Video => args.extend(["-f", video_format(quality)].map(OsString::from)),
    }
    args.push("--".into());
    args.push(url.into());
    args
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    Downloading { percent: Option<u8> },
    Finished,
}

/// Reads one stdout line produced by the progress template. Anything else
/// yt-dlp prints yields `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let mut fields = line.trim().strip_prefix("progress:")?.split(':');
    let status = fields.next()?;
    let downloaded = fields.next().and_then(parse_bytes);
    let total = fields.next().and_then(parse_bytes);
    let estimate = fields.next().and_then(parse_bytes);
    match status {
        "downloading" => {
            let percent = match (downloaded, total.or(estimate)) {
                (Some(done), Some(total)) if total > 0.0 => {
                    Some((done / total * 100.0).clamp(0.0, 100.0) as u8)
                }
                _ => None,
            };
            Some(ProgressEvent::Downloading { percent })
        }
        "finished" => Some(ProgressEvent::Finished),
        _ => None,
    }
}

// yt-dlp prints `NA` for fields it does not know.
fn parse_bytes(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoJson {
    pub title: Option<String>,
    pub duration: Option<f64>,
}

pub fn read_info_json(path: &Path) -> Result<InfoJson> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}
