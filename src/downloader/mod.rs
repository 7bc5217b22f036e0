#![forbid(unsafe_code)]

//! Background media downloads through yt-dlp, tracked in an in-memory
//! registry keyed by download id.

mod ytdlp;

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

pub use ytdlp::{
    InfoJson, MediaFormat, ProgressEvent, audio_bitrate, download_args, parse_progress_line,
    read_info_json, video_format,
};

const STDERR_TAIL_LINES: usize = 20;
const DEFAULT_FORMAT: &str = "mp4";
const DEFAULT_QUALITY: &str = "medium";
const UNKNOWN_TITLE: &str = "Unknown";
/// Side files yt-dlp leaves next to (or instead of) the finished media.
const SIDE_FILE_SUFFIXES: &[&str] = &[".part", ".ytdl", ".info.json", ".temp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    #[serde(rename = "_id")]
    pub legacy_id: String,
    pub url: String,
    pub status: DownloadStatus,
    pub progress: u8,
    pub format: String,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

struct DownloadManagerInner {
    jobs: Mutex<HashMap<String, DownloadJob>>,
    counter: AtomicU64,
    download_dir: PathBuf,
    ytdlp: PathBuf,
}

struct DownloadJob {
    sequence: u64,
    record: DownloadRecord,
    task: Option<JoinHandle<()>>,
}

struct Finished {
    title: Option<String>,
    duration: Option<f64>,
    file_size: Option<u64>,
}

/// Runs `<ytdlp> --version` and returns the reported version.
pub async fn check_available(ytdlp: &Path) -> Result<String> {
    let output = Command::new(ytdlp)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("{} is not installed", ytdlp.display()))?;
    if !output.status.success() {
        bail!("{} --version exited with {}", ytdlp.display(), output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl DownloadManager {
    pub fn new(download_dir: impl Into<PathBuf>, ytdlp: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DownloadManagerInner {
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                download_dir: download_dir.into(),
                ytdlp: ytdlp.into(),
            }),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Registers a new download and starts yt-dlp in the background. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self, request: DownloadRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let format = request
            .format
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        let quality = request
            .quality
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_QUALITY.to_string());
        let record = DownloadRecord {
            id: id.clone(),
            legacy_id: id.clone(),
            url: request.url,
            status: DownloadStatus::Starting,
            progress: 0,
            format,
            quality,
            title: None,
            duration: None,
            file_size: None,
            error_message: None,
            created_at: Utc::now(),
        };
        let sequence = self.inner.counter.fetch_add(1, Ordering::Relaxed);

        // The task blocks on this lock for its first update, so the record
        // and its handle are visible together.
        let mut jobs = self.inner.jobs.lock();
        let inner = self.inner.clone();
        let job_id = id.clone();
        let task = tokio::spawn(run_download(inner, job_id, record.clone()));
        jobs.insert(
            id.clone(),
            DownloadJob {
                sequence,
                record,
                task: Some(task),
            },
        );
        drop(jobs);
        info!(download_id = %id, "download started");
        id
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.inner.jobs.lock().get(id).map(|job| job.record.clone())
    }

    /// Every known record, oldest first.
    pub fn list(&self) -> Vec<DownloadRecord> {
        let jobs = self.inner.jobs.lock();
        let mut entries: Vec<_> = jobs
            .values()
            .map(|job| (job.sequence, job.record.clone()))
            .collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, record)| record).collect()
    }

    /// Stops a running job, removes its files and forgets the record.
    /// Returns false for unknown ids.
    ///
    /// The job's task is awaited after aborting it, which kills yt-dlp and
    /// everything it spawned before any file is removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(job) = self.inner.jobs.lock().remove(id) else {
            return Ok(false);
        };
        if let Some(task) = job.task {
            task.abort();
            let _ = task.await;
        }
        for path in files_for(&self.inner.download_dir, id).await? {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "could not remove download file");
            }
        }
        info!(download_id = %id, "download deleted");
        Ok(true)
    }

    /// The finished media file for `id`, ignoring partial and side files.
    pub async fn find_file(&self, id: &str) -> Option<PathBuf> {
        files_for(&self.inner.download_dir, id)
            .await
            .ok()?
            .into_iter()
            .find(|path| !is_side_file(path))
    }
}

impl DownloadManagerInner {
    /// Applies `f` to the record if it still exists. Deleted jobs are
    /// silently skipped.
    fn update(&self, id: &str, f: impl FnOnce(&mut DownloadRecord)) {
        if let Some(job) = self.jobs.lock().get_mut(id) {
            f(&mut job.record);
        }
    }

    fn apply_progress(&self, id: &str, event: ProgressEvent) {
        self.update(id, |record| match event {
            ProgressEvent::Downloading {
                percent: Some(percent),
            } => {
                record.progress = percent;
                record.status = DownloadStatus::Downloading;
            }
            ProgressEvent::Downloading { percent: None } => {}
            ProgressEvent::Finished => record.status = DownloadStatus::Processing,
        });
    }
}

async fn run_download(inner: Arc<DownloadManagerInner>, id: String, record: DownloadRecord) {
    match execute(&inner, &id, &record).await {
        Ok(done) => {
            info!(download_id = %id, title = ?done.title, "download completed");
            inner.update(&id, |record| {
                record.status = DownloadStatus::Completed;
                record.progress = 100;
                record.title = Some(done.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()));
                record.duration = Some(done.duration.unwrap_or(0.0));
                record.file_size = done.file_size;
            });
        }
        Err(err) => {
            warn!(download_id = %id, error = %format!("{err:#}"), "download failed");
            inner.update(&id, |record| {
                record.status = DownloadStatus::Failed;
                record.error_message = Some(format!("{err:#}"));
            });
        }
    }
}

async fn execute(
    inner: &DownloadManagerInner,
    id: &str,
    record: &DownloadRecord,
) -> Result<Finished> {
    tokio::fs::create_dir_all(&inner.download_dir)
        .await
        .with_context(|| format!("creating {}", inner.download_dir.display()))?;
    let args = download_args(
        &inner.download_dir,
        id,
        &record.url,
        MediaFormat::from_request(&record.format),
        &record.quality,
    );
    let mut command = Command::new(&inner.ytdlp);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .with_context(|| format!("launching {}", inner.ytdlp.display()))?;
    let mut group = ProcessGroup::of(&child);
    let stdout = child.stdout.take().context("yt-dlp stdout unavailable")?;
    let stderr = child.stderr.take().context("yt-dlp stderr unavailable")?;

    let progress = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = parse_progress_line(&line) {
                inner.apply_progress(id, event);
            }
        }
    };
    let ((), tail) = tokio::join!(progress, read_tail(stderr, STDERR_TAIL_LINES));
    let status = child.wait().await.context("waiting for yt-dlp")?;
    group.disarm();
    if !status.success() {
        if tail.is_empty() {
            bail!("yt-dlp exited with {status}");
        }
        bail!("{tail}");
    }

    let info_path = inner.download_dir.join(format!("{id}.info.json"));
    let info = match read_info_json(&info_path) {
        Ok(info) => info,
        Err(err) => {
            warn!(download_id = %id, error = %format!("{err:#}"), "no usable info json");
            InfoJson::default()
        }
    };
    let _ = tokio::fs::remove_file(&info_path).await;

    let files = files_for(&inner.download_dir, id).await?;
    let Some(media) = files.iter().find(|path| !is_side_file(path)) else {
        bail!("Downloaded file not found");
    };
    let file_size = tokio::fs::metadata(media).await.ok().map(|meta| meta.len());
    Ok(Finished {
        title: info.title,
        duration: info.duration,
        file_size,
    })
}

/// SIGKILLs yt-dlp's process group when dropped, taking its ffmpeg
/// post-processors with it. Armed until yt-dlp has been waited on.
struct ProcessGroup {
    #[cfg(unix)]
    leader: Option<nix::unistd::Pid>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        #[cfg(unix)]
        let group = Self {
            leader: child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(nix::unistd::Pid::from_raw),
        };
        #[cfg(not(unix))]
        let group = {
            let _ = child;
            Self {}
        };
        group
    }

    fn disarm(&mut self) {
        #[cfg(unix)]
        {
            self.leader = None;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(leader) = self.leader.take() {
            // ESRCH just means the group is already gone.
            let _ = nix::sys::signal::killpg(leader, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

async fn read_tail<R: AsyncRead + Unpin>(reader: R, keep: usize) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Every `<id>.*` entry in `dir`, sorted by name.
async fn files_for(dir: &Path, id: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{id}.");
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix))
        {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn is_side_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| SIDE_FILE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
}
