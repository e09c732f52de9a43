use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a request interacts with intermediary caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CachePolicy {
    /// Let caches answer when they can.
    #[default]
    UseCache,
    /// Force revalidation all the way to the origin.
    ReloadIgnoringCache,
}

/// State reported by an HTTP task handle.
///
/// `New` is the created-but-never-resumed state; `Canceling` covers the
/// window between a cancel request and the driver winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Running,
    Suspended,
    Completed,
    Canceling,
}

/// Externally observable state of one transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Canceled,
}

/// Cloneable snapshot of a transfer record, carried by events.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub id: String,
    pub index: usize,
    pub url: String,
    pub destination: Option<PathBuf>,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub state: TransferState,
}

impl TransferInfo {
    pub fn is_completed(&self) -> bool {
        self.state == TransferState::Completed
    }
}

/// Errors produced by the transfer engine.
///
/// Variants are cloneable on purpose: `stop(err)` fans one error out to every
/// still-open stream, so underlying `reqwest`/`io` errors are captured as
/// messages rather than wrapped sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransferError {
    #[error("transfer canceled")]
    Canceled,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("destination is not a usable local path: {0}")]
    InvalidFileUrl(String),

    #[error("no usable local data: {0}")]
    NoLocalData(String),

    #[error("server returned HTTP {0}")]
    ServerError(u16),

    #[error("payload is {size} bytes, over the {limit} byte limit")]
    OverSizeLimit { size: u64, limit: u64 },

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("{0}")]
    Failure(String),
}
