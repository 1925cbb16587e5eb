use thiserror::Error;

/// Error taxonomy for the file-backed worker pair, folded into
/// `CoordinatorError::WorkerIo` at the trait boundary.
#[derive(Debug, Error)]
pub enum IoWorkerError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("positioned read at offset {offset} in {path} failed: {source}")]
    Read {
        path: String,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("positioned write at offset {offset} in {path} failed: {source}")]
    Write {
        path: String,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to truncate {path} to {len} bytes: {source}")]
    Truncate {
        path: String,
        len: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("background I/O task panicked or was canceled: {0}")]
    TaskJoin(String),

    #[error("worker method called before its file was opened")]
    NotInitialized,
}
