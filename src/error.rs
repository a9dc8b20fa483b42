//! Error types shared across the monitor.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a listing source
#[derive(Debug, Error)]
pub enum SourceError {
    /// The current listing ids could not be enumerated
    #[error("listing discovery failed: {0}")]
    Discovery(String),

    /// One listing could not be extracted
    #[error("extraction of listing {id} failed: {reason}")]
    Extraction { id: String, reason: String },

    /// The underlying browser session is gone; nothing else will succeed until it is rebuilt
    #[error("browser session unusable: {0}")]
    Session(String),
}

impl SourceError {
    pub fn extraction(id: impl ToString, reason: impl ToString) -> Self {
        Self::Extraction {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures delivering a record to the remote API
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("API returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),
}

impl SinkError {
    /// Short label used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection(_) => "connection",
            Self::Status { .. } => "status",
            Self::Request(_) => "request",
        }
    }
}

/// Failures reading or writing on-disk state
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("atomic replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that escape a whole monitoring cycle
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Session(SourceError),
}
