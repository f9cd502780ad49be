//! Error type shared by every swapper component.

use std::path::PathBuf;

use super::types::ModelId;

/// Errors raised by the model swapper.
#[derive(Debug, thiserror::Error)]
pub enum SwapperError {
    /// The model has no input queue (never defined, or deleted).
    #[error("model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("invalid model id {id:?}: {reason}")]
    InvalidModelId { id: String, reason: &'static str },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("no checkpoint stored for model {0}")]
    CheckpointNotFound(ModelId),

    /// Process-fatal: raised at startup only.
    #[error("checkpoint root {path} is not writable: {source}")]
    CheckpointRootNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint I/O failed for model {model}: {source}")]
    CheckpointIo {
        model: ModelId,
        #[source]
        source: std::io::Error,
    },

    #[error("queue fabric failed to {context}: {source}")]
    Fabric {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("runner for model {model} failed to start: {reason}")]
    RunnerStartFailed { model: ModelId, reason: String },

    #[error("runner for model {model} crashed with return code {return_code}")]
    RunnerCrashed { model: ModelId, return_code: i32 },

    #[error("runner protocol error: {0}")]
    RunnerProtocol(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Process-fatal programming error.
    #[error("process reaper is already installed")]
    ReaperAlreadyInstalled,

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch of {len} rows exceeds the configured batch size {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("rowID {row_id} does not follow rowID {previous}")]
    RowsOutOfOrder { previous: i64, row_id: i64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SwapperError>;

impl SwapperError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SwapperError::Fabric { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
                    | Some(rusqlite::ErrorCode::SystemIoFailure)
                    | Some(rusqlite::ErrorCode::CannotOpen)
            ),
            SwapperError::CheckpointIo { .. }
            | SwapperError::Io(_)
            | SwapperError::Timeout(_)
            | SwapperError::RunnerStartFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let busy = SwapperError::Fabric {
            context: "publish".to_string(),
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ),
        };
        assert!(busy.is_transient());
        assert!(!SwapperError::ReaperAlreadyInstalled.is_transient());
        assert!(!SwapperError::EmptyBatch.is_transient());
    }
}
