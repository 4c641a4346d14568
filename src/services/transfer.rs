use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::env_u64;
use crate::errors::{RecoveryError, Result};
use crate::models::{FileFailure, TransferEvent, TransferOutcome, TransferStatus, TransferTask};
use crate::services::backups;
use crate::utils::{with_retry, DEFAULT_MAX_ATTEMPTS};

pub const STAGING_DIR_NAME: &str = ".staging";

/// Hard cap on in-flight transfers. The patch CDN rate-limits bursts.
const WORKER_COUNT: usize = 2;
const JITTER_MIN_MS: u64 = 100;
const JITTER_MAX_MS: u64 = 600;

#[derive(Clone)]
pub struct TransferPipeline {
    client: reqwest::Client,
}

impl TransferPipeline {
    pub fn new() -> Self {
        let request_timeout_seconds = env_u64("PATCH_MEDIC_HTTP_TIMEOUT_SECONDS")
            .unwrap_or(30)
            .clamp(5, 600);
        let connect_timeout_seconds = env_u64("PATCH_MEDIC_HTTP_CONNECT_TIMEOUT_SECONDS")
            .unwrap_or(10)
            .clamp(2, 60);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_seconds))
            .connect_timeout(Duration::from_secs(connect_timeout_seconds))
            .user_agent(concat!("patch-medic/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("http client");
        Self { client }
    }

    /// Downloads every file into `<dest>/.staging/`, then commits the
    /// whole batch into `dest_dir` in caller order, but only when no
    /// file failed permanently. Failed batches leave the destination
    /// untouched. Staged copies survive the commit until an explicit
    /// cleanup, an interrupted commit can always be retried.
    pub async fn download(
        &self,
        primary_root: &str,
        backup_root: Option<&str>,
        files: &[String],
        dest_dir: &Path,
        backup_before_overwrite: bool,
        events: UnboundedSender<TransferEvent>,
    ) -> Result<TransferOutcome> {
        let staging_dir = dest_dir.join(STAGING_DIR_NAME);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let mut roots: Vec<String> = vec![primary_root.to_string()];
        if let Some(backup) = backup_root {
            if !backup.is_empty() && backup != primary_root {
                roots.push(backup.to_string());
            }
        }
        let roots = Arc::new(roots);
        tracing::info!(
            "transfer start files={} roots={} dest={}",
            files.len(),
            roots.len(),
            dest_dir.display()
        );

        let table: Arc<Mutex<Vec<TransferTask>>> = Arc::new(Mutex::new(
            files.iter().map(|name| TransferTask::queued(name)).collect(),
        ));
        for file_name in files {
            let _ = events.send(TransferEvent::Queued {
                file_name: file_name.clone(),
            });
        }

        let jobs = Arc::new(files.to_vec());
        let cursor = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..WORKER_COUNT.min(jobs.len()) {
            let pipeline = self.clone();
            let jobs = jobs.clone();
            let cursor = cursor.clone();
            let roots = roots.clone();
            let table = table.clone();
            let staging_dir = staging_dir.clone();
            let events = events.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= jobs.len() {
                        break;
                    }
                    let file_name = jobs[index].clone();
                    let jitter_ms = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(JITTER_MIN_MS..=JITTER_MAX_MS)
                    };
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

                    update_task(&table, &file_name, |task| {
                        task.status = TransferStatus::Downloading;
                    });
                    let staged_path = staging_dir.join(&file_name);
                    match pipeline
                        .fetch_file(&roots, &file_name, &staged_path, &events)
                        .await
                    {
                        Ok(()) => {
                            update_task(&table, &file_name, |task| {
                                task.status = TransferStatus::Done;
                                task.progress = 100;
                            });
                            let _ = events.send(TransferEvent::Done {
                                file_name: file_name.clone(),
                            });
                        }
                        Err(err) => {
                            tracing::warn!("transfer failed for {}: {}", file_name, err);
                            update_task(&table, &file_name, |task| {
                                task.status = TransferStatus::Error;
                                task.last_error = Some(err.to_string());
                            });
                            let _ = events.send(TransferEvent::Error {
                                file_name: file_name.clone(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }));
        }
        for worker in workers {
            worker
                .await
                .map_err(|err| RecoveryError::Config(format!("transfer worker join error: {}", err)))?;
        }

        let failures: Vec<FileFailure> = {
            let tasks = lock_table(&table);
            tasks
                .iter()
                .filter(|task| task.status == TransferStatus::Error)
                .map(|task| FileFailure {
                    file_name: task.file_name.clone(),
                    message: task
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "transfer failed".to_string()),
                })
                .collect()
        };
        if !failures.is_empty() {
            tracing::warn!("transfer aborted, {} file(s) failed, nothing committed", failures.len());
            return Ok(TransferOutcome {
                success: false,
                failures,
            });
        }

        self.commit(files, dest_dir, &staging_dir, backup_before_overwrite)
            .await?;
        Ok(TransferOutcome {
            success: true,
            failures: Vec::new(),
        })
    }

    async fn fetch_file(
        &self,
        roots: &[String],
        file_name: &str,
        staged_path: &Path,
        events: &UnboundedSender<TransferEvent>,
    ) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        for root in roots {
            let url = format!("{}{}", root, file_name);
            let result = with_retry(
                &url,
                DEFAULT_MAX_ATTEMPTS,
                |delay| tokio::time::sleep(delay),
                |_attempt| self.fetch_once(&url, file_name, staged_path, events),
            )
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) => failures.push(format!("{} -> {}", url, err)),
            }
        }
        Err(RecoveryError::Http(format!(
            "all roots failed: {}",
            failures.join(" | ")
        )))
    }

    async fn fetch_once(
        &self,
        url: &str,
        file_name: &str,
        staged_path: &Path,
        events: &UnboundedSender<TransferEvent>,
    ) -> Result<()> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RecoveryError::Http(format!("HTTP {}", status)));
        }
        let result = self
            .stream_to_staging(response, file_name, staged_path, events)
            .await;
        if result.is_err() {
            // partial staged bytes must not survive into the next attempt
            let _ = tokio::fs::remove_file(staged_path).await;
        }
        result
    }

    async fn stream_to_staging(
        &self,
        response: reqwest::Response,
        file_name: &str,
        staged_path: &Path,
        events: &UnboundedSender<TransferEvent>,
    ) -> Result<()> {
        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(staged_path).await?;
        let mut stream = response.bytes_stream();
        let mut transferred: u64 = 0;
        let mut last_percent: i32 = 0;
        let _ = events.send(TransferEvent::Progress {
            file_name: file_name.to_string(),
            percent: 0,
            transferred: 0,
            total,
        });
        while let Some(next) = stream.next().await {
            let bytes = next?;
            file.write_all(&bytes).await?;
            transferred += bytes.len() as u64;
            if total > 0 {
                let percent = ((transferred.min(total) * 100) / total) as i32;
                if percent != last_percent {
                    last_percent = percent;
                    let _ = events.send(TransferEvent::Progress {
                        file_name: file_name.to_string(),
                        percent,
                        transferred,
                        total,
                    });
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        if total > 0 && transferred != total {
            return Err(RecoveryError::Http(format!(
                "short body {}/{} bytes",
                transferred, total
            )));
        }
        Ok(())
    }

    async fn commit(
        &self,
        files: &[String],
        dest_dir: &Path,
        staging_dir: &Path,
        backup_before_overwrite: bool,
    ) -> Result<()> {
        let mut backed_up = 0usize;
        for file_name in files {
            if backup_before_overwrite && backups::stash_existing(dest_dir, file_name).await? {
                backed_up += 1;
            }
            tokio::fs::copy(staging_dir.join(file_name), dest_dir.join(file_name)).await?;
            tracing::info!("committed {}", file_name);
        }
        if backup_before_overwrite && backed_up > 0 {
            backups::write_version_stamp(dest_dir).await?;
        }
        Ok(())
    }
}

impl Default for TransferPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes `<install>/.staging/`. Safe to call when it never existed.
pub async fn cleanup_staging(install_dir: &Path) -> Result<()> {
    let dir = install_dir.join(STAGING_DIR_NAME);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn lock_table(table: &Mutex<Vec<TransferTask>>) -> std::sync::MutexGuard<'_, Vec<TransferTask>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn update_task(
    table: &Mutex<Vec<TransferTask>>,
    file_name: &str,
    apply: impl FnOnce(&mut TransferTask),
) {
    let mut tasks = lock_table(table);
    if let Some(task) = tasks.iter_mut().find(|task| task.file_name == file_name) {
        apply(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::MockServer;
    use tokio::sync::mpsc;

    fn temp_install(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("patch-medic-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp install");
        dir
    }

    fn file_list(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn single_file_stages_and_commits() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/patch/Client.exe");
            then.status(200).body("fresh client bytes");
        });
        let install = temp_install("transfer");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pipeline = TransferPipeline::new();
        let outcome = pipeline
            .download(
                &format!("{}/patch/", server.base_url()),
                None,
                &file_list(&["Client.exe"]),
                &install,
                false,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(outcome.success);
        assert!(outcome.failures.is_empty());
        mock.assert();
        assert_eq!(
            std::fs::read(install.join("Client.exe")).expect("committed file"),
            b"fresh client bytes"
        );
        assert_eq!(
            std::fs::read(install.join(STAGING_DIR_NAME).join("Client.exe"))
                .expect("staged copy kept"),
            b"fresh client bytes"
        );
        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(TransferEvent::Queued { file_name }) if file_name == "Client.exe"
        ));
        assert!(matches!(
            events.last(),
            Some(TransferEvent::Done { file_name }) if file_name == "Client.exe"
        ));
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn backup_root_rescues_a_dead_primary() {
        let primary = MockServer::start_async().await;
        let backup = MockServer::start_async().await;
        let names = ["A.exe", "B.exe", "C.exe", "D.exe", "E.exe"];
        let mut primary_mocks = Vec::new();
        let mut backup_mocks = Vec::new();
        for name in names {
            primary_mocks.push(primary.mock(|when, then| {
                when.method(GET).path(format!("/cdn/{}", name));
                then.status(500);
            }));
            backup_mocks.push(backup.mock(|when, then| {
                when.method(GET).path(format!("/cdn/{}", name));
                then.status(200).body(format!("payload of {}", name));
            }));
        }
        let install = temp_install("transfer");
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = TransferPipeline::new()
            .download(
                &format!("{}/cdn/", primary.base_url()),
                Some(&format!("{}/cdn/", backup.base_url())),
                &file_list(&names),
                &install,
                false,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(outcome.success);
        for (name, mock) in names.iter().zip(&primary_mocks) {
            assert_eq!(mock.hits(), 3, "{} should exhaust the primary retries", name);
        }
        for (name, mock) in names.iter().zip(&backup_mocks) {
            assert_eq!(mock.hits(), 1, "{} should come from the backup root", name);
        }
        for name in names {
            assert_eq!(
                std::fs::read(install.join(name)).expect("committed file"),
                format!("payload of {}", name).as_bytes()
            );
            // staged copies stay behind until an explicit cleanup
            assert!(install.join(STAGING_DIR_NAME).join(name).is_file());
        }
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn permanent_failure_leaves_destination_untouched() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/cdn/Client.exe");
            then.status(500);
        });
        server.mock(|when, then| {
            when.method(GET).path("/cdn/PackCheck.exe");
            then.status(200).body("packcheck bytes");
        });
        let install = temp_install("transfer");
        std::fs::write(install.join("Client.exe"), b"live old client").expect("seed dest");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = TransferPipeline::new()
            .download(
                &format!("{}/cdn/", server.base_url()),
                None,
                &file_list(&["Client.exe", "PackCheck.exe"]),
                &install,
                true,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(!outcome.success);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].file_name, "Client.exe");
        assert_eq!(
            std::fs::read(install.join("Client.exe")).expect("dest file"),
            b"live old client"
        );
        assert!(!install.join("PackCheck.exe").exists());
        assert!(!install.join(backups::BACKUP_DIR_NAME).exists());
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            TransferEvent::Error { file_name, .. } if file_name == "Client.exe"
        )));
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn identical_backup_root_is_not_retried_twice() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/cdn/Client.exe");
            then.status(500);
        });
        let install = temp_install("transfer");
        let (tx, _rx) = mpsc::unbounded_channel();

        let root = format!("{}/cdn/", server.base_url());
        let outcome = TransferPipeline::new()
            .download(
                &root,
                Some(&root),
                &file_list(&["Client.exe"]),
                &install,
                false,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(!outcome.success);
        assert_eq!(mock.hits(), 3);
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn rerun_repeats_the_full_sequence() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/cdn/Client.exe");
            then.status(200).body("same client bytes");
        });
        let install = temp_install("transfer");

        for _ in 0..2 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let outcome = TransferPipeline::new()
                .download(
                    &format!("{}/cdn/", server.base_url()),
                    None,
                    &file_list(&["Client.exe"]),
                    &install,
                    false,
                    tx,
                )
                .await
                .expect("pipeline run");
            assert!(outcome.success);
        }
        assert_eq!(mock.hits(), 2);
        assert_eq!(
            std::fs::read(install.join("Client.exe")).expect("committed file"),
            b"same client bytes"
        );
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn backup_stamp_is_no_earlier_than_the_run() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/cdn/Client.exe");
            then.status(200).body("new client bytes");
        });
        let install = temp_install("transfer");
        std::fs::write(install.join("Client.exe"), b"old client bytes").expect("seed dest");
        let started = chrono::Utc::now().timestamp();
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = TransferPipeline::new()
            .download(
                &format!("{}/cdn/", server.base_url()),
                None,
                &file_list(&["Client.exe"]),
                &install,
                true,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(outcome.success);
        assert_eq!(
            std::fs::read(install.join(backups::BACKUP_DIR_NAME).join("Client.exe"))
                .expect("stashed original"),
            b"old client bytes"
        );
        assert_eq!(
            std::fs::read(install.join("Client.exe")).expect("dest file"),
            b"new client bytes"
        );
        let stamp = backups::backup_info(&install)
            .await
            .expect("stamp readable")
            .expect("stamp present");
        let parsed = chrono::NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S UTC")
            .expect("stamp format");
        assert!(parsed.and_utc().timestamp() >= started - 1);
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn fresh_files_skip_the_version_stamp() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/cdn/Client.exe");
            then.status(200).body("new client bytes");
        });
        let install = temp_install("transfer");
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = TransferPipeline::new()
            .download(
                &format!("{}/cdn/", server.base_url()),
                None,
                &file_list(&["Client.exe"]),
                &install,
                true,
                tx,
            )
            .await
            .expect("pipeline run");

        assert!(outcome.success);
        assert_eq!(backups::backup_info(&install).await.expect("info"), None);
        std::fs::remove_dir_all(&install).ok();
    }

    #[tokio::test]
    async fn cleanup_removes_staging() {
        let install = temp_install("transfer");
        let staging = install.join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&staging).expect("create staging");
        std::fs::write(staging.join("Client.exe"), b"staged").expect("seed staging");
        cleanup_staging(&install).await.expect("cleanup");
        assert!(!staging.exists());
        cleanup_staging(&install).await.expect("second cleanup");
        std::fs::remove_dir_all(&install).ok();
    }
}
