use thiserror::Error;

/// Error taxonomy for the buffer pool and hasher primitives.
///
/// Worker I/O and hash-verification failures are layered on top of this in
/// `blockcast-pipeline::CoordinatorError` — this enum only covers the arena
/// layer itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A precondition was violated at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The pool has been disposed; no further rent/return is possible.
    #[error("buffer pool has been disposed")]
    Disposed,

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation canceled")]
    Canceled,

    /// An internal consistency check failed. Indicates a bug in the caller,
    /// not a recoverable runtime condition.
    #[error("invariant violated: {0}")]
    Invariant(String),
}
