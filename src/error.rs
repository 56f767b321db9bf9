//! Error types for the tank node components

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage not mounted")]
    Unavailable,

    #[error("storage full: need {needed} bytes, {free} free")]
    Full { needed: u64, free: u64 },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage unavailable")]
    StorageUnavailable,

    #[error("queue write failed: {0}")]
    WriteFailed(String),

    #[error("queue read failed: {0}")]
    ReadFailed(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("delivery transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend rejected measurement with status {0}")]
    Rejected(StatusCode),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("update check transport failed: {0}")]
    Transport(reqwest::Error),

    #[error("update check returned status {0}")]
    Status(StatusCode),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("another install is already in progress")]
    Busy,

    #[error("image needs {needed} bytes, slot has {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("image transfer failed: {0}")]
    Transport(String),

    #[error("image write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer ended at {written} of {expected} bytes")]
    IncompleteTransfer { written: u64, expected: u64 },

    #[error("image checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("could not finalize staged image: {0}")]
    FinalizeFailed(String),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Install(#[from] InstallError),
}
