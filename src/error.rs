use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Deadlock: no task ready, none running, pending remain: {blocked:?}")]
    Deadlock { blocked: Vec<String> },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: crate::orchestration::WorkerId },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Collaborator binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
