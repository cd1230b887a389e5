use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaybillError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Permanent file-level failures. A file that fails validation is never
/// retried — the bytes will not get better.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Unreadable workbook: {0}")]
    Unreadable(String),

    #[error("Workbook contains no sheets")]
    NoSheets,

    #[error("Missing required columns: {columns:?}")]
    MissingColumns { columns: Vec<String> },

    #[error("Sheet contains no data rows")]
    EmptySheet,

    #[error("All {dropped} data rows were dropped during validation")]
    NoUsableRows { dropped: usize },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),
}

pub type Result<T> = std::result::Result<T, WaybillError>;
