use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No patch root in log: {0}")]
    MissingRoot(String),
    #[error("Process error: {0}")]
    Process(String),
    #[error("Another instance is active: {0}")]
    DuplicateInstance(String),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
