use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::config::RecoveryConfig;
use crate::errors::{RecoveryError, Result};
use crate::services::log_analysis;
use crate::services::process::ProcessInspector;
use crate::utils::write_atomic;

/// Blocking yes/no confirmation shown when a failed session is found.
/// Blocking is deliberate, polling pauses until the operator decides.
pub trait AlertPrompt {
    fn confirm_recovery(&self) -> Result<bool>;
}

/// Hands off the actual repair to a fresh process so the watcher keeps
/// its loop and its instance lock.
pub trait RecoveryLauncher {
    fn launch_recovery(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct WatcherState {
    pub is_target_running: bool,
    pub session_start: Option<i64>,
}

pub struct Watcher<I, P, L> {
    config: RecoveryConfig,
    install_dir: PathBuf,
    inspector: I,
    prompt: P,
    launcher: L,
    state: WatcherState,
}

impl<I, P, L> Watcher<I, P, L>
where
    I: ProcessInspector,
    P: AlertPrompt,
    L: RecoveryLauncher,
{
    pub fn new(
        config: RecoveryConfig,
        install_dir: PathBuf,
        inspector: I,
        prompt: P,
        launcher: L,
    ) -> Self {
        Self {
            config,
            install_dir,
            inspector,
            prompt,
            launcher,
            state: WatcherState::default(),
        }
    }

    /// Polls until the process exits. A failed iteration is logged and
    /// the loop keeps going.
    pub async fn run(&mut self) {
        tracing::info!(
            "watching {} every {}s",
            self.config.watched_process,
            self.config.poll_interval_secs
        );
        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!("watcher iteration failed: {}", err);
            }
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    pub async fn tick(&mut self) -> Result<()> {
        let running = self.inspector.is_running(&self.config.watched_process);
        if running && !self.state.is_target_running {
            self.state.is_target_running = true;
            self.state.session_start = Some(Utc::now().timestamp());
            tracing::info!("{} appeared", self.config.watched_process);
        } else if !running && self.state.is_target_running {
            let started = self
                .state
                .session_start
                .take()
                .unwrap_or_else(|| Utc::now().timestamp());
            self.state.is_target_running = false;
            let duration_sec = (Utc::now().timestamp() - started).max(0);
            tracing::info!(
                "{} ended after {}s",
                self.config.watched_process,
                duration_sec
            );
            self.handle_session_end(duration_sec).await?;
        }
        Ok(())
    }

    fn should_inspect(&self, duration_sec: i64) -> bool {
        self.config.check_every_session || duration_sec < self.config.short_session_secs
    }

    async fn handle_session_end(&mut self, duration_sec: i64) -> Result<()> {
        if !self.should_inspect(duration_sec) {
            return Ok(());
        }
        let install_dir = self.install_dir.clone();
        let parsed = tokio::task::spawn_blocking(move || log_analysis::analyze_log(&install_dir))
            .await
            .map_err(|err| RecoveryError::Config(format!("log analysis join error: {err}")))??;
        if !parsed.has_error {
            tracing::info!("session log is clean");
            return Ok(());
        }
        tracing::warn!(
            "failed patch session detected, {} file(s) queued",
            parsed.files_to_download.len()
        );
        if self.config.silent_recovery {
            self.launcher.launch_recovery()?;
            return Ok(());
        }
        match self.prompt.confirm_recovery() {
            Ok(true) => self.launcher.launch_recovery()?,
            Ok(false) => tracing::info!("recovery declined"),
            Err(err) => tracing::warn!("recovery prompt failed: {}", err),
        }
        Ok(())
    }
}

/// Advisory PID marker guarding against two concurrent watchers. The
/// marker is overwritten when it names a dead or unparseable process
/// and removed again on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(
        inspector: &mut dyn ProcessInspector,
        marker_path: &Path,
        current_pid: u32,
    ) -> Result<InstanceLock> {
        if let Ok(raw) = std::fs::read_to_string(marker_path) {
            if let Ok(stored_pid) = raw.trim().parse::<u32>() {
                if stored_pid != current_pid && inspector.pid_alive(stored_pid) {
                    return Err(RecoveryError::DuplicateInstance(format!(
                        "watcher already running with pid {}",
                        stored_pid
                    )));
                }
            }
        }
        write_atomic(marker_path, current_pid.to_string().as_bytes())?;
        Ok(InstanceLock {
            path: marker_path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
