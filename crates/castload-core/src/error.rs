//! Error types for the Castload core

use thiserror::Error;

/// Errors that can occur in the download core
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("invalid content type: {0}")]
    InvalidContentType(String),

    #[error("suspiciously small response body: {0} bytes")]
    SuspiciousFileSize(u64),

    #[error("incomplete body: expected {expected} bytes, received {received}")]
    TruncatedBody { expected: u64, received: u64 },

    #[error("not enough storage space")]
    OutOfStorage,

    #[error("download was cancelled")]
    Cancelled,
}

/// Messages that indicate the filesystem ran out of space when the OS error
/// code is not available through the error chain.
const OUT_OF_STORAGE_MESSAGES: [&str; 4] = ["no space", "not enough space", "disk full", "quota"];

impl DownloadError {
    /// Check if the scheduler should retry after this error.
    ///
    /// Request-shape problems, content validation failures, and storage
    /// exhaustion never resolve on their own. Transport errors and HTTP
    /// failures are retried up to the attempt ceiling.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(_)
            | DownloadError::HttpStatus(_)
            | DownloadError::Io(_)
            | DownloadError::TruncatedBody { .. } => true,
            DownloadError::EpisodeNotFound(_)
            | DownloadError::InvalidUrl(_)
            | DownloadError::InvalidContentType(_)
            | DownloadError::SuspiciousFileSize(_)
            | DownloadError::OutOfStorage
            | DownloadError::Cancelled
            | DownloadError::Database(_) => false,
        }
    }

    /// Best-effort reclassification of I/O errors as storage exhaustion,
    /// via the OS error code where available and message sniffing otherwise.
    pub fn classify_io(error: std::io::Error) -> Self {
        if is_out_of_storage(&error) {
            DownloadError::OutOfStorage
        } else {
            DownloadError::Io(error)
        }
    }
}

fn is_out_of_storage(error: &std::io::Error) -> bool {
    // ENOSPC / EDQUOT
    if matches!(error.raw_os_error(), Some(28) | Some(122)) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    OUT_OF_STORAGE_MESSAGES
        .iter()
        .any(|needle| message.contains(needle))
}
