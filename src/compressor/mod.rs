#![forbid(unsafe_code)]

//! Video compression through `ffmpeg`, with `ffprobe` for before/after sizes.

mod installer;
mod probe;
mod toolchain;

use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{process::Command, sync::Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

pub use installer::{InstallSource, Installer};
pub use probe::{VideoInfo, parse_probe_output};
pub use toolchain::{Toolchain, ToolchainReport, executable_name, installation_instructions};

const AUDIO_BITRATE_ESTIMATE_KBPS: f64 = 128.0;
const MIN_VIDEO_BITRATE_KBPS: u64 = 500;
const STDERR_TAIL_LINES: usize = 20;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Encoder settings behind a compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub crf: u8,
    pub speed: &'static str,
    pub audio_bitrate: &'static str,
}

impl CompressionLevel {
    pub const ALL: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn preset(self) -> Preset {
        match self {
            Self::Low => Preset {
                crf: 28,
                speed: "fast",
                audio_bitrate: "64k",
            },
            Self::Medium => Preset {
                crf: 23,
                speed: "medium",
                audio_bitrate: "128k",
            },
            Self::High => Preset {
                crf: 18,
                speed: "slow",
                audio_bitrate: "192k",
            },
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionLevel {
    type Err = CompressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == value.trim())
            .ok_or_else(|| CompressError::InvalidLevel(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Invalid compression level '{0}'. Choose from: low, medium, high")]
    InvalidLevel(String),
    #[error("Input file not found: {}", .0.display())]
    InputMissing(PathBuf),
    #[error("{0:#}")]
    Probe(anyhow::Error),
    #[error("Video compression failed: {0}")]
    Encode(String),
    #[error("{0:#}")]
    Io(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub file_id: String,
    pub original_filename: String,
    pub original_size_mb: f64,
    pub compressed_size_mb: f64,
    pub compression_ratio: f64,
    pub output_path: PathBuf,
    pub original_info: VideoInfo,
    pub compressed_info: VideoInfo,
}

/// Video bitrate in kbps that lands an encode near `target_mb`, leaving room
/// for the audio track. Never below 500 kbps.
pub fn calculate_bitrate(duration_secs: f64, target_mb: u64) -> u64 {
    if duration_secs <= 0.0 || !duration_secs.is_finite() {
        return MIN_VIDEO_BITRATE_KBPS;
    }
    let target_kb = target_mb as f64 * 1024.0;
    let video = (target_kb * 8.0 / duration_secs - AUDIO_BITRATE_ESTIMATE_KBPS).floor();
    if video <= MIN_VIDEO_BITRATE_KBPS as f64 {
        MIN_VIDEO_BITRATE_KBPS
    } else {
        video as u64
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn null_sink() -> &'static str {
    if cfg!(windows) { "NUL" } else { "/dev/null" }
}

fn os_args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

/// Constant-quality single pass.
fn single_pass_args(input: &Path, output: &Path, preset: Preset) -> Vec<OsString> {
    let mut args = os_args(["-y", "-i"]);
    args.push(input.into());
    args.extend(os_args(["-c:v", "libx264", "-crf"]));
    args.push(preset.crf.to_string().into());
    args.extend(os_args(["-preset", preset.speed, "-c:a", "aac", "-b:a"]));
    args.push(preset.audio_bitrate.into());
    args.push(output.into());
    args
}

/// Both passes of a bitrate-targeted encode. The first pass only writes the
/// statistics file, the second produces the output.
fn two_pass_args(
    input: &Path,
    output: &Path,
    preset: Preset,
    bitrate_kbps: u64,
    passlog: &Path,
) -> [Vec<OsString>; 2] {
    let common = |pass: &str| {
        let mut args = os_args(["-y", "-i"]);
        args.push(input.into());
        args.extend(os_args(["-c:v", "libx264", "-b:v"]));
        args.push(format!("{bitrate_kbps}k").into());
        args.extend(os_args(["-preset", preset.speed, "-pass", pass, "-passlogfile"]));
        args.push(passlog.into());
        args
    };

    let mut first = common("1");
    first.extend(os_args(["-an", "-f", "null", null_sink()]));

    let mut second = common("2");
    second.extend(os_args(["-c:a", "aac", "-b:a", preset.audio_bitrate]));
    second.push(output.into());

    [first, second]
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Compresses uploads into a single output directory. A semaphore caps how
/// many encodes run at once.
#[derive(Clone)]
pub struct VideoCompressor {
    toolchain: Toolchain,
    output_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl VideoCompressor {
    pub fn new(
        toolchain: Toolchain,
        output_dir: impl Into<PathBuf>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            toolchain,
            output_dir: output_dir.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        level: CompressionLevel,
        target_size_mb: Option<u64>,
    ) -> Result<(), CompressError> {
        let preset = level.preset();
        let Some(target) = target_size_mb else {
            return self.run_ffmpeg(single_pass_args(input, output, preset)).await;
        };

        let info = self.toolchain.probe(input).await.map_err(CompressError::Probe)?;
        let bitrate = calculate_bitrate(info.duration, target);
        info!(
            input = %input.display(),
            target_mb = target,
            bitrate_kbps = bitrate,
            "two-pass encode"
        );
        let passlog_dir = tempfile::tempdir().map_err(|err| {
            CompressError::Io(anyhow::Error::new(err).context("creating pass log dir"))
        })?;
        let passlog = passlog_dir.path().join("ffmpeg2pass");
        let [first, second] = two_pass_args(input, output, preset, bitrate, &passlog);
        self.run_ffmpeg(first).await?;
        self.run_ffmpeg(second).await
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<(), CompressError> {
        let output = Command::new(&self.toolchain.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                CompressError::Encode(format!(
                    "could not launch {}: {err}",
                    self.toolchain.ffmpeg.display()
                ))
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CompressError::Encode(stderr_tail(&output.stderr)))
        }
    }

    /// Compresses `input` into `compressed_<id>_<name>` and reports the size
    /// change. A partial output is removed on failure.
    pub async fn process_video(
        &self,
        input: &Path,
        level: CompressionLevel,
        target_size_mb: Option<u64>,
    ) -> Result<CompressionResult, CompressError> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(CompressError::InputMissing(input.to_path_buf()));
        }
        let original_filename = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let file_id = Uuid::new_v4().to_string();
        let output_path = self
            .output_dir
            .join(format!("compressed_{file_id}_{original_filename}"));

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| CompressError::Io(anyhow::Error::new(err)))?;

        let result = self
            .encode_and_measure(input, &output_path, level, target_size_mb)
            .await;
        let (original_info, compressed_info) = match result {
            Ok(infos) => infos,
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&output_path).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(
                        path = %output_path.display(),
                        error = %remove_err,
                        "failed to remove partial output"
                    );
                }
                return Err(err);
            }
        };

        let original_size_mb = original_info.size as f64 / BYTES_PER_MB;
        let compressed_size_mb = compressed_info.size as f64 / BYTES_PER_MB;
        let compression_ratio = if original_size_mb > 0.0 {
            (1.0 - compressed_size_mb / original_size_mb) * 100.0
        } else {
            0.0
        };
        info!(
            file_id = %file_id,
            level = %level,
            original_mb = round2(original_size_mb),
            compressed_mb = round2(compressed_size_mb),
            "compressed video"
        );

        Ok(CompressionResult {
            file_id,
            original_filename,
            original_size_mb: round2(original_size_mb),
            compressed_size_mb: round2(compressed_size_mb),
            compression_ratio: round2(compression_ratio),
            output_path,
            original_info,
            compressed_info,
        })
    }

    async fn encode_and_measure(
        &self,
        input: &Path,
        output: &Path,
        level: CompressionLevel,
        target_size_mb: Option<u64>,
    ) -> Result<(VideoInfo, VideoInfo), CompressError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| CompressError::Io(anyhow::Error::new(err)))?;
        let original = self.toolchain.probe(input).await.map_err(CompressError::Probe)?;
        self.compress(input, output, level, target_size_mb).await?;
        let compressed = self.toolchain.probe(output).await.map_err(CompressError::Probe)?;
        Ok((original, compressed))
    }

    pub async fn find_output(&self, file_id: &str) -> Option<PathBuf> {
        find_compressed(&self.output_dir, file_id).await
    }
}

/// First file in `dir` whose name contains `file_id`.
pub async fn find_compressed(dir: &Path, file_id: &str) -> Option<PathBuf> {
    if file_id.is_empty() {
        return None;
    }
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry.file_type().await.is_ok_and(|kind| kind.is_file());
        if is_file && entry.file_name().to_string_lossy().contains(file_id) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    matches.into_iter().next()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    // Writes a fixed payload to the last argument unless it is the null sink,
    // and records every invocation.
    const FFMPEG_STUB: &str = r#"
log="$(dirname "$0")/ffmpeg.log"
echo "$*" >> "$log"
for arg in "$@"; do out="$arg"; done
if [[ "$*" == *"FAIL"* ]]; then echo "boom: encoder exploded" >&2; exit 1; fi
if [[ "$out" != "/dev/null" ]]; then printf '%0512d' 0 > "$out"; fi
"#;

    const FFPROBE_STUB: &str = r#"
for arg in "$@"; do target="$arg"; done
size=$(wc -c < "$target" | tr -d ' ')
printf '{"format": {"duration": "8.0", "size": "%s", "bit_rate": "1000", "format_name": "mp4"}, "streams": [{"codec_type": "video", "codec_name": "h264", "width": 640, "height": 360, "avg_frame_rate": "25/1"}]}' "$size"
"#;

    // Records how many encodes are running whenever one starts.
    const SLOW_FFMPEG_STUB: &str = r#"
bin="$(dirname "$0")"
mkdir -p "$bin/running"
touch "$bin/running/$$"
ls "$bin/running" | wc -l | tr -d ' ' >> "$bin/overlap.log"
sleep 0.3
rm -f "$bin/running/$$"
for arg in "$@"; do out="$arg"; done
printf '%0512d' 0 > "$out"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        compressor: VideoCompressor,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            Self::with_ffmpeg(FFMPEG_STUB, 2)
        }

        fn with_ffmpeg(stub: &str, max_concurrent: usize) -> Result<Self> {
            let dir = tempdir()?;
            let bin = dir.path().join("bin");
            fs::create_dir_all(&bin)?;
            let ffmpeg = write_script(&bin, "ffmpeg", stub)?;
            let ffprobe = write_script(&bin, "ffprobe", FFPROBE_STUB)?;
            let compressor = VideoCompressor::new(
                Toolchain::new(ffmpeg, ffprobe),
                dir.path().join("compressed"),
                max_concurrent,
            );
            Ok(Self { dir, compressor })
        }

        fn input(&self, name: &str, bytes: usize) -> Result<PathBuf> {
            let path = self.dir.path().join(name);
            fs::write(&path, vec![b'v'; bytes])?;
            Ok(path)
        }

        fn ffmpeg_log(&self) -> String {
            fs::read_to_string(self.dir.path().join("bin/ffmpeg.log")).unwrap_or_default()
        }
    }

    #[test]
    fn levels_parse_and_map_to_presets() {
        assert_eq!("low".parse::<CompressionLevel>().unwrap(), CompressionLevel::Low);
        assert_eq!(CompressionLevel::default(), CompressionLevel::Medium);
        assert!(matches!(
            "ultra".parse::<CompressionLevel>(),
            Err(CompressError::InvalidLevel(_))
        ));
        let high = CompressionLevel::High.preset();
        assert_eq!((high.crf, high.speed, high.audio_bitrate), (18, "slow", "192k"));
        let low = CompressionLevel::Low.preset();
        assert_eq!((low.crf, low.speed, low.audio_bitrate), (28, "fast", "64k"));
    }

    #[test]
    fn bitrate_calculation() {
        // 10 MB over 60 s: 10240 * 8 / 60 - 128 = 1237.33
        assert_eq!(calculate_bitrate(60.0, 10), 1237);
        assert_eq!(calculate_bitrate(600.0, 1), MIN_VIDEO_BITRATE_KBPS);
        assert_eq!(calculate_bitrate(0.0, 10), MIN_VIDEO_BITRATE_KBPS);
    }

    #[test]
    fn two_pass_uses_bitrate_as_output_option() {
        let [first, second] = two_pass_args(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            CompressionLevel::Medium.preset(),
            900,
            Path::new("/tmp/log"),
        );
        let first: Vec<_> = first.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let second: Vec<_> = second.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let input_at = first.iter().position(|a| a == "in.mp4").unwrap();
        let bitrate_at = first.iter().position(|a| a == "900k").unwrap();
        assert!(bitrate_at > input_at);
        assert!(!first.contains(&"-crf".to_string()));
        assert!(first.ends_with(&["-an".into(), "-f".into(), "null".into(), "/dev/null".into()]));
        assert_eq!(second.last().map(String::as_str), Some("out.mp4"));
        assert!(second.windows(2).any(|w| w == ["-pass", "2"]));
    }

    #[tokio::test]
    async fn process_video_reports_sizes() -> Result<()> {
        let fixture = Fixture::new()?;
        let input = fixture.input("clip.mp4", 1024)?;

        let result = fixture
            .compressor
            .process_video(&input, CompressionLevel::Low, None)
            .await?;
        assert_eq!(result.original_filename, "clip.mp4");
        assert!(result.output_path.exists());
        assert_eq!(
            result.output_path.file_name().unwrap().to_string_lossy(),
            format!("compressed_{}_clip.mp4", result.file_id)
        );
        assert_eq!(result.original_info.size, 1024);
        assert_eq!(result.compressed_info.size, 512);
        assert_eq!(result.compression_ratio, 50.0);
        assert_eq!(result.original_size_mb, 0.0);
        assert!(fixture.ffmpeg_log().contains("-crf 28 -preset fast"));

        let found = fixture.compressor.find_output(&result.file_id).await;
        assert_eq!(found, Some(result.output_path.clone()));
        Ok(())
    }

    #[tokio::test]
    async fn target_size_runs_two_passes() -> Result<()> {
        let fixture = Fixture::new()?;
        let input = fixture.input("clip.mp4", 2048)?;
        fixture
            .compressor
            .process_video(&input, CompressionLevel::Medium, Some(5))
            .await?;
        let log = fixture.ffmpeg_log();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("-pass 1"));
        assert!(log.contains("-pass 2"));
        // 5 MB over the stub's 8 s: 5120 * 8 / 8 - 128
        assert!(log.contains("-b:v 4992k"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_encodes_are_capped() -> Result<()> {
        let fixture = Fixture::with_ffmpeg(SLOW_FFMPEG_STUB, 2)?;
        let mut jobs = Vec::new();
        for n in 0..5 {
            let input = fixture.input(&format!("clip{n}.mp4"), 256)?;
            let compressor = fixture.compressor.clone();
            jobs.push(tokio::spawn(async move {
                compressor
                    .process_video(&input, CompressionLevel::Low, None)
                    .await
            }));
        }
        for job in jobs {
            job.await??;
        }

        let log = fs::read_to_string(fixture.dir.path().join("bin/overlap.log"))?;
        let counts: Vec<usize> = log.lines().map(|line| line.parse().unwrap()).collect();
        assert_eq!(counts.len(), 5);
        assert_eq!(counts.iter().max(), Some(&2));
        Ok(())
    }

    #[tokio::test]
    async fn failed_encode_cleans_up() -> Result<()> {
        let fixture = Fixture::new()?;
        let input = fixture.input("FAIL.mp4", 64)?;
        let err = fixture
            .compressor
            .process_video(&input, CompressionLevel::Medium, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CompressError::Encode(ref msg) if msg.contains("boom")));
        let leftovers = fs::read_dir(fixture.compressor.output_dir())?.count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_input_is_rejected() -> Result<()> {
        let fixture = Fixture::new()?;
        let err = fixture
            .compressor
            .process_video(
                &fixture.dir.path().join("nope.mp4"),
                CompressionLevel::Medium,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CompressError::InputMissing(_)));
        Ok(())
    }

    #[tokio::test]
    async fn find_output_ignores_unknown_ids() -> Result<()> {
        let fixture = Fixture::new()?;
        assert!(fixture.compressor.find_output("missing").await.is_none());
        assert!(fixture.compressor.find_output("").await.is_none());
        Ok(())
    }
}
