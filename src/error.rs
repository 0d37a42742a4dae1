use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the ingest and query paths.
pub(crate) type Result<T> = std::result::Result<T, IngestError>;

/// Everything that can go wrong between receiving an upload and answering a chart query.
#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("Uploaded file is empty")]
    EmptyFile,

    #[error("Malformed CSV: {reason}")]
    MalformedInput { reason: String },

    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Required column missing: {missing}")]
    SchemaMismatch { missing: String },

    #[error("Run store unavailable at {}: {reason}", path.display())]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("Ingest failed, previous data kept: {source}")]
    IngestFailed {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Run {run_number} has an unparseable timestamp: {value:?}")]
    BadTimestamp { run_number: u64, value: String },
}

impl IngestError {
    /// True when the caller supplied bad data (HTTP 400); false for store problems (HTTP 500).
    pub(crate) fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyFile
                | Self::MalformedInput { .. }
                | Self::PayloadTooLarge { .. }
                | Self::SchemaMismatch { .. }
        )
    }

    pub(crate) fn status_code(&self) -> u16 {
        if self.is_client_error() { 400 } else { 500 }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}
