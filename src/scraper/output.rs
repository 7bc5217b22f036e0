use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use url::Url;

use super::parser::ScrapedPage;
use crate::security::secure_filename;

const MAX_FILENAME_CHARS: usize = 100;
const RULE_WIDTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    /// `"json"` selects JSON; any other value falls back to plain text.
    pub fn from_request(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub filepath: PathBuf,
    pub size: u64,
    pub created: DateTime<Local>,
    pub modified: DateTime<Local>,
}

/// Writes scraped pages into a single output directory.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, page: &ScrapedPage, format: OutputFormat) -> Result<PathBuf> {
        match format {
            OutputFormat::Json => self.save_as_json(page),
            OutputFormat::Text => self.save_as_text(page),
        }
    }

    pub fn save_as_json(&self, page: &ScrapedPage) -> Result<PathBuf> {
        let path = self.target_path(&page.url, OutputFormat::Json)?;
        let payload = serde_json::to_vec_pretty(page)?;
        fs::write(&path, payload).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn save_as_text(&self, page: &ScrapedPage) -> Result<PathBuf> {
        let path = self.target_path(&page.url, OutputFormat::Text)?;
        let scraped_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        fs::write(&path, render_text(page, &scraped_at))
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    fn target_path(&self, url: &str, format: OutputFormat) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        Ok(self.dir.join(generate_filename(url, format.extension())?))
    }
}

pub fn file_info(path: &Path) -> Result<FileInfo> {
    let metadata = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    let modified: DateTime<Local> = metadata
        .modified()
        .with_context(|| format!("reading mtime of {}", path.display()))?
        .into();
    let created = metadata.created().map(DateTime::from).unwrap_or(modified);
    Ok(FileInfo {
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        filepath: path.to_path_buf(),
        size: metadata.len(),
        created,
        modified,
    })
}

/// `<host>_<path>.<ext>`, or `<host>_homepage.<ext>` for the site root.
///
/// The result only contains `[A-Za-z0-9._-]`, so it survives the sanitising
/// applied by the download route unchanged.
pub fn generate_filename(url: &str, extension: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("parsing {url}"))?;
    let mut domain = parsed.host_str().unwrap_or_default().to_string();
    if let Some(port) = parsed.port() {
        let _ = write!(domain, "_{port}");
    }
    let path = parsed.path().trim_matches('/');
    let raw = if path.is_empty() {
        format!("{domain}_homepage.{extension}")
    } else {
        let safe_path = path.replace(['/', '?', '='], "_");
        format!("{domain}_{safe_path}.{extension}")
    };

    let mut filename = secure_filename(&raw);
    if filename.chars().count() > MAX_FILENAME_CHARS {
        filename = filename.chars().take(MAX_FILENAME_CHARS).collect();
        let _ = write!(filename, ".{extension}");
    }
    if filename.is_empty() {
        filename = format!("page.{extension}");
    }
    Ok(filename)
}

fn render_text(page: &ScrapedPage, scraped_at: &str) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();
    let _ = writeln!(out, "URL: {}", page.url);
    let _ = writeln!(out, "Title: {}", page.title);
    let _ = writeln!(out, "Scraped at: {scraped_at}");
    let _ = writeln!(out, "{rule}\n");

    if !page.metadata.is_empty() {
        out.push_str("METADATA:\n");
        for (key, value) in page.metadata.entries() {
            if !value.is_empty() {
                let _ = writeln!(out, "{key}: {value}");
            }
        }
        let _ = writeln!(out, "\n{rule}\n");
    }

    for section in &page.content {
        let _ = writeln!(out, "{}", section.heading.to_uppercase());
        let _ = writeln!(out, "{}\n", "-".repeat(section.heading.chars().count()));
        for paragraph in &section.content {
            let _ = writeln!(out, "{paragraph}\n");
        }
        out.push('\n');
    }
    out
}
