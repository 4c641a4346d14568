use tokio::sync::mpsc;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use crate::config::RecoveryConfig;
use crate::errors::{RecoveryError, Result};
use crate::models::{TransferEvent, TransferOutcome};
use crate::services::log_analysis;
use crate::services::process::{ensure_target_idle, SystemInspector};
use crate::services::transfer::TransferPipeline;
use crate::services::watcher::{AlertPrompt, RecoveryLauncher};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[inline]
fn hide_console_window(command: &mut std::process::Command) {
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    {
        let _ = command;
    }
}

/// Runs one full repair: analyze the client log, bail out early when the
/// last session was clean, make sure the launcher is closed, then pull
/// the queued files through the transfer pipeline.
pub async fn run_recovery(config: &RecoveryConfig, force: bool) -> Result<TransferOutcome> {
    let install_dir = config.install_dir.clone().ok_or_else(|| {
        RecoveryError::Config("no install directory configured, pass --install-dir once".to_string())
    })?;

    let analysis_dir = install_dir.clone();
    let mut parsed = tokio::task::spawn_blocking(move || log_analysis::analyze_log(&analysis_dir))
        .await
        .map_err(|err| RecoveryError::Config(format!("log analysis join error: {err}")))??;
    if force {
        parsed = log_analysis::force_patch_result(&parsed)?;
    }
    tracing::info!(
        "analysis error={} queued={} root={}",
        parsed.has_error,
        parsed.files_to_download.len(),
        parsed.web_root.as_deref().unwrap_or("-")
    );

    if !parsed.needs_recovery() {
        tracing::info!("last session left nothing to repair");
        return Ok(TransferOutcome {
            success: true,
            failures: Vec::new(),
        });
    }

    let mut inspector = SystemInspector::new();
    ensure_target_idle(&mut inspector, &config.watched_process)?;

    let primary_root = parsed
        .web_root
        .clone()
        .ok_or_else(|| RecoveryError::MissingRoot("web root missing from client log".to_string()))?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                TransferEvent::Queued { file_name } => {
                    tracing::info!("queued {}", file_name);
                }
                TransferEvent::Progress {
                    file_name,
                    percent,
                    transferred,
                    total,
                } => {
                    tracing::debug!("{} {}% ({}/{} bytes)", file_name, percent, transferred, total);
                }
                TransferEvent::Done { file_name } => {
                    tracing::info!("finished {}", file_name);
                }
                TransferEvent::Error { file_name, message } => {
                    tracing::warn!("{} failed: {}", file_name, message);
                }
            }
        }
    });

    let pipeline = TransferPipeline::new();
    let outcome = pipeline
        .download(
            &primary_root,
            parsed.backup_web_root.as_deref(),
            &parsed.files_to_download,
            &install_dir,
            config.backup_before_overwrite,
            events_tx,
        )
        .await;
    let _ = reporter.await;
    let outcome = outcome?;

    if outcome.success {
        tracing::info!(
            "repair complete, {} file(s) replaced",
            parsed.files_to_download.len()
        );
    } else {
        tracing::warn!("repair failed for {} file(s)", outcome.failures.len());
    }
    Ok(outcome)
}

/// OS-native yes/no confirmation. The watcher has no window of its own,
/// so Windows gets a real message box via PowerShell and everything
/// else falls back to a terminal prompt.
pub struct NativeDialogPrompt;

#[cfg(target_os = "windows")]
impl AlertPrompt for NativeDialogPrompt {
    fn confirm_recovery(&self) -> Result<bool> {
        let script = "Add-Type -AssemblyName PresentationCore,PresentationFramework; \
            $result = [System.Windows.MessageBox]::Show(\
            'A failed Starfall patch was detected. Run the repair now?', \
            'Starfall Patch Medic', 'YesNo', 'Warning'); \
            if ($result -eq 'Yes') { exit 0 } else { exit 1 }";
        let mut command = std::process::Command::new("powershell");
        command.args(["-NoProfile", "-Command", script]);
        hide_console_window(&mut command);
        let status = command.status()?;
        Ok(status.code() == Some(0))
    }
}

#[cfg(not(target_os = "windows"))]
impl AlertPrompt for NativeDialogPrompt {
    fn confirm_recovery(&self) -> Result<bool> {
        use std::io::Write;
        print!("A failed Starfall patch was detected. Run the repair now? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        let normalized = answer.trim().to_ascii_lowercase();
        Ok(normalized == "y" || normalized == "yes")
    }
}

/// Restarts this binary with the `fix` subcommand, detached, so the
/// repair survives the watcher and the watcher keeps its lock.
pub struct SelfRelauncher;

impl RecoveryLauncher for SelfRelauncher {
    fn launch_recovery(&self) -> Result<()> {
        let exe = std::env::current_exe()?;
        let mut command = std::process::Command::new(exe);
        command
            .arg("fix")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        hide_console_window(&mut command);
        let child = command.spawn()?;
        tracing::info!("repair process started with pid {}", child.id());
        Ok(())
    }
}
