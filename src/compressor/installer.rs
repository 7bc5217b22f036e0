use std::{
    env,
    ffi::OsStr,
    fs,
    io::{self, BufReader, Cursor, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::info;
use walkdir::WalkDir;

use super::toolchain::{Toolchain, executable_name};

const TOOLS: [&str; 2] = ["ffmpeg", "ffprobe"];
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Where an installed toolchain came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallSource {
    AlreadyInstalled,
    SystemPath,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarXz,
    Zip,
}

/// Places `ffmpeg` and `ffprobe` under `<tools_dir>/bin`.
pub struct Installer {
    tools_dir: PathBuf,
    agent: ureq::Agent,
}

impl Installer {
    pub fn new(tools_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            agent: ureq::AgentBuilder::new().timeout(DOWNLOAD_TIMEOUT).build(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.tools_dir.join("bin")
    }

    pub fn is_installed(&self) -> bool {
        let bin = self.bin_dir();
        TOOLS
            .iter()
            .all(|tool| bin.join(executable_name(tool)).is_file())
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::resolve(&self.tools_dir)
    }

    /// Blocking. Reuses binaries found on `PATH` before downloading a static
    /// build for the current platform.
    pub fn install(&self) -> Result<InstallSource> {
        if self.is_installed() {
            return Ok(InstallSource::AlreadyInstalled);
        }
        fs::create_dir_all(self.bin_dir())
            .with_context(|| format!("creating {}", self.bin_dir().display()))?;

        if let Some(path_var) = env::var_os("PATH")
            && self.adopt_from_path(&path_var)?
        {
            return Ok(InstallSource::SystemPath);
        }
        self.download_and_install()?;
        Ok(InstallSource::Download)
    }

    /// Copies both tools from the first `PATH` entries that contain them.
    /// Returns false when either one is missing.
    pub fn adopt_from_path(&self, path_var: &OsStr) -> Result<bool> {
        let found: Option<Vec<PathBuf>> = TOOLS
            .iter()
            .map(|tool| find_on_path(path_var, &executable_name(tool)))
            .collect();
        let Some(found) = found else {
            return Ok(false);
        };
        let bin = self.bin_dir();
        fs::create_dir_all(&bin).with_context(|| format!("creating {}", bin.display()))?;
        for source in found {
            let Some(name) = source.file_name() else {
                continue;
            };
            install_binary(&source, &bin.join(name))?;
            info!(source = %source.display(), "adopted binary from PATH");
        }
        Ok(self.is_installed())
    }

    pub fn download_and_install(&self) -> Result<()> {
        let staging = tempfile::tempdir().context("creating staging directory")?;
        for (index, (url, kind)) in release_archives(env::consts::OS, env::consts::ARCH)?
            .iter()
            .enumerate()
        {
            info!(url, "downloading ffmpeg build");
            let bytes = self.download(url)?;
            let target = staging.path().join(index.to_string());
            match kind {
                ArchiveKind::TarXz => unpack_tar_xz(&bytes, &target)?,
                ArchiveKind::Zip => unpack_zip(&bytes, &target)?,
            }
        }
        self.install_from_dir(staging.path())?;
        if !self.is_installed() {
            bail!("ffmpeg and ffprobe were not found in the downloaded archives");
        }
        Ok(())
    }

    /// Searches an unpacked tree for both tools and copies them into the bin
    /// directory.
    pub fn install_from_dir(&self, root: &Path) -> Result<()> {
        let bin = self.bin_dir();
        fs::create_dir_all(&bin).with_context(|| format!("creating {}", bin.display()))?;
        for tool in TOOLS {
            let name = executable_name(tool);
            let source = find_in_tree(root, &name)
                .with_context(|| format!("{name} not found under {}", root.display()))?;
            install_binary(&source, &bin.join(&name))?;
        }
        Ok(())
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("downloading {url}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading {url}"))?;
        Ok(bytes)
    }
}

fn release_archives(os: &str, arch: &str) -> Result<Vec<(String, ArchiveKind)>> {
    Ok(match (os, arch) {
        ("linux", "x86_64") => vec![(linux_url("amd64"), ArchiveKind::TarXz)],
        ("linux", "aarch64") => vec![(linux_url("arm64"), ArchiveKind::TarXz)],
        ("macos", _) => TOOLS
            .iter()
            .map(|tool| {
                (
                    format!("https://evermeet.cx/ffmpeg/{tool}-6.0.zip"),
                    ArchiveKind::Zip,
                )
            })
            .collect(),
        ("windows", _) => vec![(
            "https://www.gyan.dev/ffmpeg/builds/ffmpeg-git-essentials.zip".to_string(),
            ArchiveKind::Zip,
        )],
        _ => bail!("no prebuilt ffmpeg for {os}/{arch}"),
    })
}

fn linux_url(arch: &str) -> String {
    format!("https://johnvansickle.com/ffmpeg/releases/ffmpeg-release-{arch}-static.tar.xz")
}

pub(crate) fn unpack_tar_xz(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut tar_bytes = Vec::new();
    lzma_rs::xz_decompress(&mut BufReader::new(Cursor::new(bytes)), &mut tar_bytes)
        .map_err(|err| anyhow::anyhow!("decompressing xz archive: {err:?}"))?;
    fs::create_dir_all(dest)?;
    tar::Archive::new(Cursor::new(tar_bytes))
        .unpack(dest)
        .with_context(|| format!("unpacking tar into {}", dest.display()))
}

pub(crate) fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("reading zip archive")?;
    fs::create_dir_all(dest)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn find_on_path(path_var: &OsStr, name: &str) -> Option<PathBuf> {
    env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn find_in_tree(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .map(walkdir::DirEntry::into_path)
}

fn install_binary(source: &Path, target: &Path) -> Result<()> {
    let partial = target.with_extension("partial");
    fs::copy(source, &partial)
        .with_context(|| format!("copying {} to {}", source.display(), partial.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&partial, fs::Permissions::from_mode(0o755))?;
    }
    fs::rename(&partial, target).with_context(|| format!("installing {}", target.display()))?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_xz_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *body).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut xz = Vec::new();
        lzma_rs::xz_compress(&mut BufReader::new(Cursor::new(tar_bytes)), &mut xz).unwrap();
        xz
    }

    fn zip_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (path, body) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn installs_from_tar_xz_release() -> Result<()> {
        let archive = tar_xz_with(&[
            ("ffmpeg-7.0-amd64-static/ffmpeg", b"ffmpeg-bin"),
            ("ffmpeg-7.0-amd64-static/ffprobe", b"ffprobe-bin"),
            ("ffmpeg-7.0-amd64-static/readme.txt", b"docs"),
        ]);
        let staging = tempdir()?;
        unpack_tar_xz(&archive, staging.path())?;

        let tools = tempdir()?;
        let installer = Installer::new(tools.path());
        assert!(!installer.is_installed());
        installer.install_from_dir(staging.path())?;
        assert!(installer.is_installed());

        let ffmpeg = installer.bin_dir().join("ffmpeg");
        assert_eq!(fs::read(&ffmpeg)?, b"ffmpeg-bin");
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(fs::metadata(&ffmpeg)?.permissions().mode() & 0o777, 0o755);
        assert_eq!(installer.toolchain().ffmpeg, ffmpeg);
        Ok(())
    }

    #[test]
    fn installs_from_zip_release() -> Result<()> {
        let archive = zip_with(&[
            ("build/bin/ffmpeg", b"a"),
            ("build/bin/ffprobe", b"b"),
        ]);
        let staging = tempdir()?;
        unpack_zip(&archive, staging.path())?;

        let tools = tempdir()?;
        let installer = Installer::new(tools.path());
        installer.install_from_dir(staging.path())?;
        assert!(installer.is_installed());
        Ok(())
    }

    #[test]
    fn incomplete_archive_is_an_error() -> Result<()> {
        let staging = tempdir()?;
        unpack_zip(&zip_with(&[("ffmpeg", b"only one")]), staging.path())?;
        let tools = tempdir()?;
        let err = Installer::new(tools.path())
            .install_from_dir(staging.path())
            .unwrap_err();
        assert!(err.to_string().contains("ffprobe"));
        Ok(())
    }

    #[test]
    fn adopts_binaries_from_path() -> Result<()> {
        let first = tempdir()?;
        let second = tempdir()?;
        write_script(first.path(), "ffmpeg", "echo ffmpeg")?;
        write_script(second.path(), "ffprobe", "echo ffprobe")?;
        let path_var = env::join_paths([first.path(), second.path()])?;

        let tools = tempdir()?;
        let installer = Installer::new(tools.path());
        assert!(installer.adopt_from_path(&path_var)?);
        assert!(installer.is_installed());
        assert_eq!(installer.install()?, InstallSource::AlreadyInstalled);
        Ok(())
    }

    #[test]
    fn path_missing_a_tool_is_not_adopted() -> Result<()> {
        let dir = tempdir()?;
        write_script(dir.path(), "ffmpeg", "echo ffmpeg")?;
        let tools = tempdir()?;
        let installer = Installer::new(tools.path());
        assert!(!installer.adopt_from_path(dir.path().as_os_str())?);
        assert!(!installer.bin_dir().join("ffmpeg").exists());
        Ok(())
    }

    #[test]
    fn release_urls_cover_supported_platforms() {
        let linux = release_archives("linux", "x86_64").unwrap();
        assert!(linux[0].0.ends_with("ffmpeg-release-amd64-static.tar.xz"));
        assert_eq!(release_archives("macos", "aarch64").unwrap().len(), 2);
        assert_eq!(release_archives("windows", "x86_64").unwrap()[0].1, ArchiveKind::Zip);
        assert!(release_archives("freebsd", "x86_64").is_err());
    }
}
