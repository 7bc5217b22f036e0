use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::process::Command;

/// Locations of the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolchainReport {
    pub installed: bool,
    pub error: Option<String>,
    pub system: String,
    pub instructions: String,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffprobe_version: Option<String>,
}

/// Platform file name of a tool, e.g. `ffmpeg.exe` on Windows.
pub fn executable_name(tool: &str) -> String {
    format!("{tool}{}", env::consts::EXE_SUFFIX)
}

impl Toolchain {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Prefers binaries installed under `<tools_dir>/bin`, falling back to a
    /// bare name resolved through `PATH`.
    pub fn resolve(tools_dir: &Path) -> Self {
        let pick = |tool: &str| {
            let local = tools_dir.join("bin").join(executable_name(tool));
            if local.is_file() {
                local
            } else {
                PathBuf::from(tool)
            }
        };
        Self {
            ffmpeg: pick("ffmpeg"),
            ffprobe: pick("ffprobe"),
        }
    }

    /// Runs `-version` on both tools.
    pub async fn check(&self) -> Result<()> {
        run_version(&self.ffmpeg).await?;
        run_version(&self.ffprobe).await?;
        Ok(())
    }

    pub async fn report(&self) -> ToolchainReport {
        let check = self.check().await;
        let installed = check.is_ok();
        let (ffmpeg_version, ffprobe_version) = if installed {
            (
                first_version_line(&self.ffmpeg).await,
                first_version_line(&self.ffprobe).await,
            )
        } else {
            (None, None)
        };
        ToolchainReport {
            installed,
            error: check.err().map(|err| format!("{err:#}")),
            system: env::consts::OS.to_string(),
            instructions: installation_instructions(env::consts::OS).to_string(),
            ffmpeg_path: self.ffmpeg.clone(),
            ffprobe_path: self.ffprobe.clone(),
            ffmpeg_version,
            ffprobe_version,
        }
    }
}

async fn run_version(binary: &Path) -> Result<()> {
    let status = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("{} is not installed or not in PATH", binary.display()))?;
    if !status.success() {
        bail!("{} -version exited with {status}", binary.display());
    }
    Ok(())
}

async fn first_version_line(binary: &Path) -> Option<String> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::to_string)
}

pub fn installation_instructions(os: &str) -> &'static str {
    match os {
        "macos" => {
            "FFmpeg installation options for macOS:
1. Homebrew: brew install ffmpeg
2. MacPorts: sudo port install ffmpeg
3. Pre-built binaries from https://evermeet.cx/ffmpeg/ moved into /usr/local/bin/
4. Run `ffmpeg_setup install` to place a static build in the local tools directory"
        }
        "linux" => {
            "FFmpeg installation options for Linux:
1. Ubuntu/Debian: sudo apt update && sudo apt install ffmpeg
2. CentOS/RHEL/Fedora: sudo dnf install ffmpeg
3. Arch Linux: sudo pacman -S ffmpeg
4. Run `ffmpeg_setup install` to place a static build in the local tools directory"
        }
        "windows" => {
            "FFmpeg installation options for Windows:
1. Download a build from https://ffmpeg.org/download.html
2. Extract the archive and add its 'bin' directory to PATH
3. Run `ffmpeg_setup install` to place a build in the local tools directory"
        }
        _ => "Download FFmpeg for your system from https://ffmpeg.org/download.html",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use tempfile::tempdir;

    #[test]
    fn resolve_prefers_local_binaries() -> Result<()> {
        let dir = tempdir()?;
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin)?;
        write_script(&bin, "ffmpeg", "echo local")?;

        let toolchain = Toolchain::resolve(dir.path());
        assert_eq!(toolchain.ffmpeg, bin.join("ffmpeg"));
        assert_eq!(toolchain.ffprobe, PathBuf::from("ffprobe"));
        Ok(())
    }

    #[tokio::test]
    async fn report_includes_versions() -> Result<()> {
        let dir = tempdir()?;
        let ffmpeg = write_script(dir.path(), "ffmpeg", "echo 'ffmpeg version 6.1-test'")?;
        let ffprobe = write_script(dir.path(), "ffprobe", "echo 'ffprobe version 6.1-test'")?;

        let report = Toolchain::new(ffmpeg, ffprobe).report().await;
        assert!(report.installed);
        assert!(report.error.is_none());
        assert_eq!(report.ffmpeg_version.as_deref(), Some("ffmpeg version 6.1-test"));
        assert_eq!(report.ffprobe_version.as_deref(), Some("ffprobe version 6.1-test"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_binaries_are_reported() -> Result<()> {
        let dir = tempdir()?;
        let toolchain = Toolchain::new(dir.path().join("nope"), dir.path().join("nope2"));
        assert!(toolchain.check().await.is_err());

        let report = toolchain.report().await;
        assert!(!report.installed);
        assert!(report.error.unwrap().contains("not installed"));
        assert!(!report.instructions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_binary_is_not_installed() -> Result<()> {
        let dir = tempdir()?;
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exit 1")?;
        let ffprobe = write_script(dir.path(), "ffprobe", "exit 0")?;
        assert!(Toolchain::new(ffmpeg, ffprobe).check().await.is_err());
        Ok(())
    }
}
