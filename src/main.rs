mod config;
mod errors;
mod logging;
mod models;
mod services;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::config::RecoveryConfig;
use crate::errors::{RecoveryError, Result};
use crate::services::recovery::{run_recovery, NativeDialogPrompt, SelfRelauncher};
use crate::services::watcher::{InstanceLock, Watcher};
use crate::services::{backups, transfer, SystemInspector};

#[derive(Parser)]
#[command(
    name = "patch-medic",
    version,
    about = "Detects and repairs broken Starfall patch states"
)]
struct Cli {
    /// Starfall install directory, remembered after the first use
    #[arg(long, global = true, value_name = "DIR")]
    install_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the launcher and offer a repair after failed sessions
    Watch {
        /// Repair without asking first
        #[arg(long)]
        silent: bool,
    },
    /// Analyze the client log and repair the queued files now
    Fix {
        /// Re-download the whole whitelist even when the log is clean
        #[arg(long)]
        force: bool,
        /// Suppress the console summary
        #[arg(long)]
        silent: bool,
    },
    /// Copy the last pre-repair backup over the installation
    Restore,
    /// Show when the last backup was taken
    BackupInfo,
    /// Remove staged downloads, and with --backups the backups too
    Cleanup {
        #[arg(long)]
        backups: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&config::log_root()) {
        eprintln!("logging init failed: {err}");
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RecoveryError::DuplicateInstance(message)) => {
            // a second watcher leaves quietly instead of crashing
            tracing::warn!("{}", message);
            eprintln!("{message}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = RecoveryConfig::load();
    if let Some(dir) = cli.install_dir {
        if config.install_dir.as_deref() != Some(dir.as_path()) {
            config.install_dir = Some(dir);
            config.save()?;
        }
    }
    match cli.command {
        Command::Watch { silent } => watch(config, silent).await,
        Command::Fix { force, silent } => fix(config, force, silent).await,
        Command::Restore => restore(config).await,
        Command::BackupInfo => backup_info(config).await,
        Command::Cleanup { backups } => cleanup(config, backups).await,
    }
}

async fn watch(mut config: RecoveryConfig, silent: bool) -> Result<()> {
    if silent {
        config.silent_recovery = true;
    }
    let install_dir = require_install_dir(&config)?;
    let marker_path = config::data_root().join("watcher.pid");
    let mut inspector = SystemInspector::new();
    let _lock = InstanceLock::acquire(&mut inspector, &marker_path, std::process::id())?;
    let mut watcher = Watcher::new(
        config,
        install_dir,
        inspector,
        NativeDialogPrompt,
        SelfRelauncher,
    );
    watcher.run().await;
    Ok(())
}

async fn fix(config: RecoveryConfig, force: bool, silent: bool) -> Result<()> {
    let outcome = run_recovery(&config, force).await?;
    if outcome.success {
        if !silent {
            println!("Repair finished, installation is up to date.");
        }
        return Ok(());
    }
    if !silent {
        eprintln!("Repair failed for {} file(s):", outcome.failures.len());
        for failure in &outcome.failures {
            eprintln!("  {}: {}", failure.file_name, failure.message);
        }
    }
    Err(RecoveryError::Http(format!(
        "{} file(s) could not be repaired",
        outcome.failures.len()
    )))
}

async fn restore(config: RecoveryConfig) -> Result<()> {
    let install_dir = require_install_dir(&config)?;
    let restored = backups::restore_backup(&install_dir).await?;
    println!("Restored {restored} file(s) from backup.");
    Ok(())
}

async fn backup_info(config: RecoveryConfig) -> Result<()> {
    let install_dir = require_install_dir(&config)?;
    match backups::backup_info(&install_dir).await? {
        Some(stamp) => println!("Last backup: {stamp}"),
        None => println!("No backup found."),
    }
    Ok(())
}

async fn cleanup(config: RecoveryConfig, include_backups: bool) -> Result<()> {
    let install_dir = require_install_dir(&config)?;
    transfer::cleanup_staging(&install_dir).await?;
    println!("Staging area removed.");
    if include_backups {
        backups::delete_backup(&install_dir).await?;
        println!("Backups removed.");
    }
    Ok(())
}

fn require_install_dir(config: &RecoveryConfig) -> Result<PathBuf> {
    config.install_dir.clone().ok_or_else(|| {
        RecoveryError::Config(
            "no install directory configured, pass --install-dir once".to_string(),
        )
    })
}
