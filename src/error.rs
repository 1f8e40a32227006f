use std::time::Duration;

/// Failure reported by the object-storage client while archiving one file.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("s3 {operation} failed: {message}")]
    Service {
        operation: &'static str,
        message: String,
    },

    #[error("s3 did not return an upload id for {key}")]
    MissingUploadId { key: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("part upload task did not finish: {message}")]
    PartTask { message: String },
}

impl StorageError {
    pub(crate) fn service(
        operation: &'static str,
        err: impl std::error::Error + 'static,
    ) -> Self {
        Self::Service {
            operation,
            message: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("lark request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lark {api} returned code {code}: {msg}")]
    Api {
        api: &'static str,
        code: i64,
        msg: String,
    },

    #[error("lark {api} returned an unexpected body: {message}")]
    Malformed { api: &'static str, message: String },
}

/// Why a single endpoint ended up in the failure list.
#[derive(Debug, thiserror::Error)]
pub enum BackupFailure {
    #[error("snapshot command timed out after {}s", .0.as_secs())]
    SnapshotTimedOut(Duration),

    #[error("snapshot command exited with code {code:?}: {stderr}")]
    SnapshotExited { code: Option<i32>, stderr: String },

    #[error("snapshot command could not be started: {0}")]
    SnapshotSpawn(String),

    #[error("snapshot output is missing {marker:?}: {stdout}")]
    MissingMarker { marker: String, stdout: String },

    #[error(transparent)]
    Upload(#[from] StorageError),

    #[error("panicked while backing up: {0}")]
    Panicked(String),
}
