#![forbid(unsafe_code)]

//! Checks for, or installs, the ffmpeg/ffprobe pair used by the compressor.

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use motherhen::{
    compressor::{InstallSource, Installer},
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_logging,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ffmpeg_setup", about = "Manage the local ffmpeg installation")]
struct SetupArgs {
    #[arg(long)]
    data_root: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: SetupCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum SetupCommand {
    /// Print what the compressor would use and whether it works.
    Check,
    /// Copy ffmpeg from PATH or download a static build into the tools dir.
    Install,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = SetupArgs::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        data_root: args.data_root,
        env_path: args.env_file,
        ..RuntimeOverrides::default()
    })?;
    config.prepare()?;
    let _log_guard = init_logging(&config.logs_dir(), config.log_format)?;

    let installer = Installer::new(config.tools_dir.clone());
    if let SetupCommand::Install = args.command {
        let bin_dir = installer.bin_dir();
        let source = tokio::task::spawn_blocking(move || installer.install())
            .await
            .context("install task panicked")??;
        match source {
            InstallSource::AlreadyInstalled => {
                println!("ffmpeg already installed in {}", bin_dir.display())
            }
            InstallSource::SystemPath => {
                println!("Copied ffmpeg from PATH into {}", bin_dir.display())
            }
            InstallSource::Download => {
                println!("Downloaded ffmpeg into {}", bin_dir.display())
            }
        }
        info!(?source, "ffmpeg install finished");
    }

    let report = Installer::new(config.tools_dir.clone())
        .toolchain()
        .report()
        .await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );
    if report.installed {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", report.instructions);
        Ok(ExitCode::FAILURE)
    }
}
