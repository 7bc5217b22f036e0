#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_ROOT: &str = ".";
pub const DEFAULT_WWW_ROOT: &str = "build";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 1000;
pub const DEFAULT_MAX_COMPRESSIONS: usize = 2;
pub const DEFAULT_SCRAPE_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_SCRAPE_RETRIES: u32 = 3;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

const DOWNLOADS_SUBDIR: &str = "downloads";
const COMPRESSED_SUBDIR: &str = "compressed";
const SCRAPED_SUBDIR: &str = "scraped";
const LOGS_SUBDIR: &str = "logs";
const TOOLS_SUBDIR: &str = "tools/ffmpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub www_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_upload_mb: u64,
    pub max_concurrent_compressions: usize,
    pub scrape_delay_secs: f64,
    pub scrape_retries: u32,
    pub ytdlp_bin: PathBuf,
    pub tools_dir: PathBuf,
    pub log_format: LogFormat,
}

impl RuntimeConfig {
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_root.join(DOWNLOADS_SUBDIR)
    }

    pub fn compressed_dir(&self) -> PathBuf {
        self.data_root.join(COMPRESSED_SUBDIR)
    }

    pub fn scraped_dir(&self) -> PathBuf {
        self.data_root.join(SCRAPED_SUBDIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join(LOGS_SUBDIR)
    }

    pub fn scrape_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.scrape_delay_secs).unwrap_or(Duration::ZERO)
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    /// Creates every output directory the services write into.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.downloads_dir(),
            self.compressed_dir(),
            self.scraped_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Values given on the command line. They win over the process environment,
/// which wins over the env file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_config_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeConfig {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .or_else(|| lookup("MOTHERHEN_DATA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("MOTHERHEN_WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = overrides
        .port
        .or_else(|| parse_value("MOTHERHEN_PORT", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MOTHERHEN_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let max_upload_mb = parse_value("MOTHERHEN_MAX_UPLOAD_MB", file_vars, &env_lookup)
        .filter(|value: &u64| *value > 0)
        .unwrap_or(DEFAULT_MAX_UPLOAD_MB);
    let max_concurrent_compressions =
        parse_value("MOTHERHEN_MAX_COMPRESSIONS", file_vars, &env_lookup)
            .filter(|value: &usize| *value > 0)
            .unwrap_or(DEFAULT_MAX_COMPRESSIONS);
    let scrape_delay_secs = parse_value("MOTHERHEN_SCRAPE_DELAY_SECS", file_vars, &env_lookup)
        .filter(|value: &f64| value.is_finite() && *value >= 0.0)
        .unwrap_or(DEFAULT_SCRAPE_DELAY_SECS);
    let scrape_retries = parse_value("MOTHERHEN_SCRAPE_RETRIES", file_vars, &env_lookup)
        .filter(|value: &u32| *value > 0)
        .unwrap_or(DEFAULT_SCRAPE_RETRIES);
    let ytdlp_bin = lookup("MOTHERHEN_YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let tools_dir = lookup("MOTHERHEN_TOOLS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_root.join(TOOLS_SUBDIR));
    let log_format = match lookup("MOTHERHEN_LOG_FORMAT")
        .map(|value| value.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };

    RuntimeConfig {
        data_root,
        www_root,
        host,
        port,
        max_upload_mb,
        max_concurrent_compressions,
        scrape_delay_secs,
        scrape_retries,
        ytdlp_bin,
        tools_dir,
        log_format,
    }
}

fn parse_value<T: FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.parse().ok())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let runtime = build_runtime_config(&HashMap::new(), |_| None);
        assert_eq!(runtime.data_root, PathBuf::from(DEFAULT_DATA_ROOT));
        assert_eq!(runtime.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.max_upload_mb, DEFAULT_MAX_UPLOAD_MB);
        assert_eq!(runtime.max_concurrent_compressions, DEFAULT_MAX_COMPRESSIONS);
        assert_eq!(runtime.scrape_retries, DEFAULT_SCRAPE_RETRIES);
        assert_eq!(runtime.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(runtime.tools_dir, PathBuf::from(".").join("tools/ffmpeg"));
        assert_eq!(runtime.log_format, LogFormat::Pretty);
    }

    #[test]
    fn env_file_values_are_used() {
        let runtime = runtime_from(
            "MOTHERHEN_DATA_ROOT=\"/srv/hen\"\nMOTHERHEN_PORT=\"4242\"\nMOTHERHEN_LOG_FORMAT=JSON\n",
        );
        assert_eq!(runtime.data_root, PathBuf::from("/srv/hen"));
        assert_eq!(runtime.port, 4242);
        assert_eq!(runtime.tools_dir, PathBuf::from("/srv/hen/tools/ffmpeg"));
        assert_eq!(runtime.downloads_dir(), PathBuf::from("/srv/hen/downloads"));
        assert_eq!(runtime.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let runtime = runtime_from(
            "MOTHERHEN_PORT=\"nope\"\nMOTHERHEN_MAX_COMPRESSIONS=0\nMOTHERHEN_SCRAPE_DELAY_SECS=-3\n",
        );
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.max_concurrent_compressions, DEFAULT_MAX_COMPRESSIONS);
        assert_eq!(runtime.scrape_delay_secs, DEFAULT_SCRAPE_DELAY_SECS);
    }

    #[test]
    fn derived_limits() {
        let runtime = runtime_from("MOTHERHEN_MAX_UPLOAD_MB=2\nMOTHERHEN_SCRAPE_DELAY_SECS=0.5\n");
        assert_eq!(runtime.max_upload_bytes(), 2 * 1024 * 1024);
        assert_eq!(runtime.scrape_delay(), Duration::from_millis(500));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("MOTHERHEN_WWW_ROOT=\"/file\"\n").path()).unwrap();
        let runtime = build_runtime_config(&vars, |key| {
            if key == "MOTHERHEN_WWW_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(runtime.www_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MOTHERHEN_DATA_ROOT="/data"
            MOTHERHEN_WWW_ROOT='/www'
            MOTHERHEN_HOST =  "0.0.0.0"
            MOTHERHEN_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MOTHERHEN_DATA_ROOT").unwrap(), "/data");
        assert_eq!(vars.get("MOTHERHEN_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("MOTHERHEN_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("MOTHERHEN_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("MOTHERHEN_DATA_ROOT".to_string(), "/file-data".to_string());
        vars.insert("MOTHERHEN_WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("MOTHERHEN_HOST".to_string(), "file-host".to_string());
        vars.insert("MOTHERHEN_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            data_root: Some(PathBuf::from("/override-data")),
            www_root: None,
            port: Some(9000),
            host: Some("override-host".into()),
            env_path: None,
        };

        let runtime = build_runtime_config_with_overrides(
            &vars,
            |key| {
                if key == "MOTHERHEN_WWW_ROOT" {
                    Some("/env-www".to_string())
                } else if key == "MOTHERHEN_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(runtime.data_root, PathBuf::from("/override-data"));
        assert_eq!(runtime.www_root, PathBuf::from("/env-www"));
        assert_eq!(runtime.port, 9000);
        assert_eq!(runtime.host, "override-host");
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let runtime = build_runtime_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(runtime.host, DEFAULT_HOST);
    }

    #[test]
    fn prepare_creates_output_directories() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build_runtime_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                data_root: Some(dir.path().to_path_buf()),
                ..RuntimeOverrides::default()
            },
        );
        runtime.prepare().unwrap();
        assert!(runtime.downloads_dir().is_dir());
        assert!(runtime.compressed_dir().is_dir());
        assert!(runtime.scraped_dir().is_dir());
        assert!(runtime.logs_dir().is_dir());
    }
}
