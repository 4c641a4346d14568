use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{RecoveryError, Result};
use crate::models::LogParseResult;

/// Files the patcher is allowed to re-download. Anything else queued in
/// the log is ignored.
pub const CORE_FILE_WHITELIST: [&str; 6] = [
    "Client.exe",
    "PackCheck.exe",
    "Starfall.exe",
    "Starfall_x64.exe",
    "Starfall_GL.exe",
    "Starfall_x64_GL.exe",
];

/// Written by the client at the top of every session block.
pub const SESSION_OPENING_MARKER: &str = "***** CLIENT LOG FILE OPENING *****";

const WEB_ROOT_MARKER: &str = "Web root:";
const BACKUP_ROOT_MARKER: &str = "Backup Web root:";
const QUEUE_MARKER: &str = "Queue file to download:";

const GL_VARIANT: &str = "Starfall_GL.exe";
const GL_SIBLINGS: [&str; 3] = ["Starfall.exe", "Starfall_x64.exe", "Starfall_x64_GL.exe"];

/// Only this much of the log tail is inspected. Client logs grow for
/// months and the interesting session is always at the end.
const TAIL_WINDOW_BYTES: u64 = 2 * 1024 * 1024;

static PID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?:INFO|WARN|ERROR)\s+Client\s+(\d+)\]").expect("pid regex"));
static WEB_ROOT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Web root: (https?://\S+)").expect("web root regex"));
static BACKUP_ROOT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Backup Web root: (https?://\S+)").expect("backup root regex"));

pub fn client_log_path(install_dir: &Path) -> PathBuf {
    install_dir.join("logs").join("Client.txt")
}

/// Parses the most recent client session out of `<install>/logs/Client.txt`
/// and reports which whitelisted files the patcher failed to update.
/// A session without warnings or errors yields an empty download list.
pub fn analyze_log(install_dir: &Path) -> Result<LogParseResult> {
    let log_path = client_log_path(install_dir);
    if !log_path.is_file() {
        return Err(RecoveryError::NotFound(format!(
            "client log at {}",
            log_path.display()
        )));
    }
    let window = read_tail_window(&log_path)?;
    Ok(parse_session(&window))
}

/// Same result shape as [`analyze_log`] but with every whitelisted file
/// queued, for operator-forced repairs. Requires a web root in the log.
pub fn force_patch_result(base: &LogParseResult) -> Result<LogParseResult> {
    if base.web_root.is_none() {
        return Err(RecoveryError::MissingRoot(
            "force patch needs a web root in the client log".to_string(),
        ));
    }
    Ok(LogParseResult {
        web_root: base.web_root.clone(),
        backup_web_root: base.backup_web_root.clone(),
        files_to_download: CORE_FILE_WHITELIST
            .iter()
            .map(|name| name.to_string())
            .collect(),
        has_error: true,
    })
}

fn read_tail_window(log_path: &Path) -> Result<String> {
    let mut file = File::open(log_path)?;
    let len = file.metadata()?.len();
    if len > TAIL_WINDOW_BYTES {
        file.seek(SeekFrom::End(-(TAIL_WINDOW_BYTES as i64)))?;
    }
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn parse_session(window: &str) -> LogParseResult {
    let lines: Vec<&str> = window.split('\n').collect();

    let mut opening_index = 0;
    for (index, line) in lines.iter().enumerate().rev() {
        if line.contains(SESSION_OPENING_MARKER) {
            opening_index = index;
            break;
        }
    }
    let session = &lines[opening_index..];

    let mut session_pid: Option<String> = None;
    for line in session {
        if let Some(caps) = PID_PATTERN.captures(line) {
            session_pid = Some(caps[1].to_string());
            break;
        }
    }

    let mut web_root: Option<String> = None;
    let mut backup_web_root: Option<String> = None;
    let mut files_to_download: Vec<String> = Vec::new();
    let mut has_error = false;

    for line in session {
        if let Some(pid) = &session_pid {
            if !line.contains(&format!("Client {}", pid)) {
                continue;
            }
        }

        if line.contains("[WARN") || line.contains("[ERROR") || line.contains("Error:") {
            has_error = true;
        }

        // The backup marker contains the plain marker as a substring, so
        // it has to be tested first. Later occurrences overwrite earlier
        // ones, the client reprints the roots after every CDN failover.
        if line.contains(BACKUP_ROOT_MARKER) {
            if let Some(caps) = BACKUP_ROOT_PATTERN.captures(line) {
                backup_web_root = Some(caps[1].to_string());
            }
        } else if line.contains(WEB_ROOT_MARKER) {
            if let Some(caps) = WEB_ROOT_PATTERN.captures(line) {
                web_root = Some(caps[1].to_string());
            }
        } else if let Some(position) = line.find(QUEUE_MARKER) {
            let file_name = line[position + QUEUE_MARKER.len()..].trim();
            if !file_name.is_empty()
                && CORE_FILE_WHITELIST.contains(&file_name)
                && !files_to_download.iter().any(|known| known == file_name)
            {
                files_to_download.push(file_name.to_string());
            }
        }
    }

    if !has_error {
        // A clean session means the client patched itself, nothing to redo.
        files_to_download.clear();
    } else if files_to_download.iter().any(|name| name == GL_VARIANT) {
        // The GL build ships as a family, a broken GL binary means its
        // siblings are suspect too.
        for sibling in GL_SIBLINGS {
            if !files_to_download.iter().any(|known| known == sibling) {
                files_to_download.push(sibling.to_string());
            }
        }
    }

    LogParseResult {
        web_root,
        backup_web_root,
        files_to_download,
        has_error,
    }
}
