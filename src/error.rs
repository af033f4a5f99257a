use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open WAL file {path}: {source}")]
    LogOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("WAL write failed: {0}")]
    LogWriteFailed(#[source] io::Error),

    #[error("Failed to encode sample: {0}")]
    EncodeFailed(String),

    #[error("Failed to decode sample: {0}")]
    DecodeFailed(String),

    /// Reserved for capacity-rejection policies; the current MemTable never refuses.
    #[error("MemTable rejected sample: {0}")]
    MemoryInsertFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(#[source] Box<StorageError>),

    #[error("WAL truncate failed: {0}")]
    TruncateFailed(#[source] io::Error),

    #[error("WAL close failed: {0}")]
    CloseFailed(#[source] io::Error),

    #[error("Corrupted segment: {0}")]
    CorruptedSegment(String),

    #[error("Corrupted checkpoint: {0}")]
    CorruptedCheckpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Storage engine is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
