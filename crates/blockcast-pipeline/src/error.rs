use blockcast_core::CoreError;
use thiserror::Error;

/// Error taxonomy for the pipeline and coordinator layer: abstract failure
/// kinds, expressed as a closed Rust enum rather than a grab-bag string.
#[derive(Debug, Error, Clone)]
pub enum CoordinatorError {
    /// A precondition was violated at construction or at `execute` time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation canceled")]
    Canceled,

    /// A worker's initialize/fill/drain/finalize raised an error.
    #[error("worker I/O error: {0}")]
    WorkerIo(String),

    /// The reference and verification digests differ byte-for-byte.
    #[error("hash verification failed: digest mismatch")]
    HashVerificationMismatch,

    /// The reference hasher itself failed; the verification pass never had a
    /// value to compare against.
    #[error("hash verification failed: reference digest unavailable: {0}")]
    HashVerificationReferenceFailed(Box<CoordinatorError>),

    /// An internal consistency check failed. Indicates a bug, not a
    /// recoverable runtime condition.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// `execute` was called while a transfer was already in flight.
    #[error("coordinator is already executing a transfer")]
    AlreadyRunning,

    /// Propagated from the buffer-pool layer.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CoordinatorError {
    /// True for the variants that represent cooperative cancellation rather
    /// than a genuine failure.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, CoordinatorError::Canceled)
            || matches!(self, CoordinatorError::Core(CoreError::Canceled))
    }
}

/// The sum-type outcome of one `execute` call or one state machine's run.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// No exceptions were recorded.
    Success,
    /// Every recorded exception was a cancellation.
    Canceled,
    /// Exactly one non-cancellation failure was recorded.
    Failed(CoordinatorError),
    /// More than one non-cancellation failure was recorded.
    Aggregated(Vec<CoordinatorError>),
}

impl CompletionOutcome {
    /// Folds a list of recorded exceptions into a single outcome:
    /// all-cancellations collapses to `Canceled`, exactly one real error
    /// surfaces directly, more than one is aggregated.
    #[must_use]
    pub fn from_exceptions(mut exceptions: Vec<CoordinatorError>) -> Self {
        if exceptions.is_empty() {
            return CompletionOutcome::Success;
        }
        let real: Vec<CoordinatorError> =
            exceptions.drain(..).filter(|e| !e.is_canceled()).collect();
        match real.len() {
            0 => CompletionOutcome::Canceled,
            1 => CompletionOutcome::Failed(real.into_iter().next().unwrap()),
            _ => CompletionOutcome::Aggregated(real),
        }
    }

    /// True if this outcome represents a fully successful run (no errors of
    /// any kind, including cancellation).
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }
}
