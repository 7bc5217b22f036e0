use std::{path::Path, process::Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::toolchain::Toolchain;

/// The subset of `ffprobe` output the compressor reports on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoInfo {
    pub duration: f64,
    pub size: u64,
    pub bitrate: u64,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

// ffprobe prints numeric format fields as strings.
#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
    format_name: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

impl Toolchain {
    pub async fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json"])
            .args(["-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("launching {}", self.ffprobe.display()))?;
        if !output.status.success() {
            bail!(
                "Failed to get video info: ffprobe exited with {} for {}",
                output.status,
                path.display()
            );
        }
        parse_probe_output(&output.stdout).context("Failed to get video info")
    }
}

pub fn parse_probe_output(raw: &[u8]) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_slice(raw).context("parsing ffprobe json")?;
    let number = |value: &Option<String>| {
        value
            .as_deref()
            .and_then(|value| value.trim().parse::<f64>().ok())
    };

    let mut info = VideoInfo {
        duration: number(&probe.format.duration).unwrap_or(0.0),
        size: number(&probe.format.size).map_or(0, |v| v as u64),
        bitrate: number(&probe.format.bit_rate).map_or(0, |v| v as u64),
        format: probe
            .format
            .format_name
            .unwrap_or_else(|| "unknown".to_string()),
        ..VideoInfo::default()
    };

    if let Some(stream) = probe
        .streams
        .into_iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
    {
        info.width = stream.width;
        info.height = stream.height;
        info.codec = stream.codec_name;
        info.fps = stream.avg_frame_rate;
    }
    Ok(info)
}
