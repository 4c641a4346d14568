use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::utils::{ensure_dir, write_atomic};

pub const DEFAULT_WATCHED_PROCESS: &str = "StarfallLauncher.exe";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SHORT_SESSION_SECS: i64 = 300;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub install_dir: Option<PathBuf>,
    pub watched_process: String,
    pub poll_interval_secs: u64,
    pub short_session_secs: i64,
    pub check_every_session: bool,
    pub silent_recovery: bool,
    pub backup_before_overwrite: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            watched_process: DEFAULT_WATCHED_PROCESS.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            short_session_secs: DEFAULT_SHORT_SESSION_SECS,
            check_every_session: false,
            silent_recovery: false,
            backup_before_overwrite: true,
        }
    }
}

impl RecoveryConfig {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<RecoveryConfig>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!("invalid config at {}, using defaults: {}", path.display(), err);
                    RecoveryConfig::default()
                }
            },
            Err(_) => RecoveryConfig::default(),
        };
        config.apply_env_overrides();
        config
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &payload)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if env_truthy("PATCH_MEDIC_SILENT") {
            self.silent_recovery = true;
        }
        if env_truthy("PATCH_MEDIC_EVERY_SESSION") {
            self.check_every_session = true;
        }
        if env_truthy("PATCH_MEDIC_NO_BACKUP") {
            self.backup_before_overwrite = false;
        }
        if let Some(secs) = env_u64("PATCH_MEDIC_POLL_SECS") {
            self.poll_interval_secs = secs.clamp(1, 3600);
        }
    }
}

pub fn config_path() -> PathBuf {
    config_root().join("config.json")
}

pub fn config_root() -> PathBuf {
    if let Some(dir) = env_dir("PATCH_MEDIC_CONFIG_DIR") {
        return dir;
    }
    if let Some(base) = dirs::config_dir() {
        if let Some(dir) = ensure_dir(&base.join("patch-medic")) {
            return dir;
        }
    }
    if let Some(home) = dirs::home_dir() {
        if let Some(dir) = ensure_dir(&home.join(".patch-medic")) {
            return dir;
        }
    }
    PathBuf::from(".patch-medic")
}

pub fn data_root() -> PathBuf {
    if let Some(dir) = env_dir("PATCH_MEDIC_DATA_DIR") {
        return dir;
    }
    if let Some(base) = dirs::data_dir() {
        if let Some(dir) = ensure_dir(&base.join("patch-medic")) {
            return dir;
        }
    }
    if let Some(home) = dirs::home_dir() {
        if let Some(dir) = ensure_dir(&home.join(".patch-medic")) {
            return dir;
        }
    }
    PathBuf::from(".patch-medic")
}

pub fn log_root() -> PathBuf {
    if let Some(dir) = env_dir("PATCH_MEDIC_LOG_DIR") {
        return dir;
    }
    let logs = data_root().join("logs");
    ensure_dir(&logs).unwrap_or(logs)
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

pub(crate) fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}
