use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures contained inside a single subject's `ExtractionResult`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("classification timed out after {budget:?}")]
    ClassificationTimeout { budget: Duration },

    #[error("recognizer failed: {0}")]
    BackendFailure(String),

    #[error("recognizer returned no text")]
    EmptyOutput,

    #[error("extraction aborted: {0}")]
    Internal(String),
}

/// Resource-level failures around the benchmark log. These are surfaced to
/// the caller; malformed blocks are not errors and never reach this type.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("log I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key cannot be written to the log: {0}")]
    InvalidKey(String),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: path.into(),
            source,
        }
    }
}
