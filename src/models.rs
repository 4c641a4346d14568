use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LogParseResult {
    pub web_root: Option<String>,
    pub backup_web_root: Option<String>,
    pub files_to_download: Vec<String>,
    pub has_error: bool,
}

impl LogParseResult {
    pub fn needs_recovery(&self) -> bool {
        self.has_error && !self.files_to_download.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Waiting,
    Downloading,
    Done,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransferTask {
    pub file_name: String,
    pub status: TransferStatus,
    pub progress: i32,
    pub last_error: Option<String>,
}

impl TransferTask {
    pub fn queued(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            status: TransferStatus::Waiting,
            progress: 0,
            last_error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferEvent {
    Queued {
        file_name: String,
    },
    Progress {
        file_name: String,
        percent: i32,
        transferred: u64,
        total: u64,
    },
    Done {
        file_name: String,
    },
    Error {
        file_name: String,
        message: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileFailure {
    pub file_name: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TransferOutcome {
    pub success: bool,
    pub failures: Vec<FileFailure>,
}
