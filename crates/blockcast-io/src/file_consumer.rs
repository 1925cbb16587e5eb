use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockcast_core::Buffer;
use blockcast_pipeline::{ContextSlot, CoordinatorError, VerificationHandles, WorkerContext};
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;

use crate::error::IoWorkerError;

/// Writes a file sequentially (as a sequence of block-sized chunks) at each
/// buffer's `sequence() * capacity()` offset, tolerating out-of-order
/// delivery the same way `ConsumerWorker::drain`'s contract requires. On
/// `finalize`, truncates the file to the true end-of-stream length (the
/// short last block may be smaller than `capacity()`, so the file's actual
/// size can't be derived from the block count alone).
///
/// Built on `std::os::unix::fs::FileExt::write_at` run inside
/// `tokio::task::spawn_blocking`, the positioned-write counterpart to
/// [`crate::file_producer::FileProducerWorker`]'s positioned reads.
pub struct FileConsumerWorker {
    path: PathBuf,
    file: OnceCell<Arc<std::fs::File>>,
    true_len: AtomicU64,
    context: ContextSlot,
    max_concurrency: usize,
}

impl FileConsumerWorker {
    /// Creates a worker that will create-or-truncate `path` once
    /// [`initialize`] has run.
    ///
    /// [`initialize`]: blockcast_pipeline::ConsumerWorker::initialize
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_concurrency: usize) -> Self {
        Self {
            path: path.into(),
            file: OnceCell::new(),
            true_len: AtomicU64::new(0),
            context: ContextSlot::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    fn file_handle(&self) -> Result<Arc<std::fs::File>, IoWorkerError> {
        self.file
            .get()
            .cloned()
            .ok_or(IoWorkerError::NotInitialized)
    }
}

impl blockcast_pipeline::ConsumerWorker for FileConsumerWorker {
    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn attach(&self, context: WorkerContext) {
        self.context.attach(context);
    }

    fn detach(&self) {
        self.context.detach();
    }

    async fn initialize(&self) -> Result<(), CoordinatorError> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
        })
        .await
        .map_err(|e| CoordinatorError::WorkerIo(IoWorkerError::TaskJoin(e.to_string()).to_string()))?
        .map_err(|source| {
            IoWorkerError::Open {
                path: self.path.display().to_string(),
                source,
            }
            .to_string()
        })
        .map_err(CoordinatorError::WorkerIo)?;
        let _ = self.file.set(Arc::new(file));
        Ok(())
    }

    async fn drain(&self, buffer: &Buffer) -> Result<(), CoordinatorError> {
        if self.context.get().is_canceled() {
            return Err(CoordinatorError::Canceled);
        }
        let file = self.file_handle().map_err(|e| CoordinatorError::WorkerIo(e.to_string()))?;
        let seq = buffer.sequence();
        let offset = seq * buffer.capacity() as u64;
        let data = buffer.data().to_vec();
        let path = self.path.display().to_string();
        let end = offset + data.len() as u64;

        self.true_len.fetch_max(end, Ordering::AcqRel);

        tokio::task::spawn_blocking(move || {
            file.write_at(&data, offset)
                .map(|_| ())
                .map_err(|source| IoWorkerError::Write {
                    path,
                    offset,
                    source,
                })
        })
        .await
        .map_err(|e| CoordinatorError::WorkerIo(IoWorkerError::TaskJoin(e.to_string()).to_string()))?
        .map_err(|e| CoordinatorError::WorkerIo(e.to_string()))
    }

    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<blockcast_core::Digest>, CoordinatorError> {
        let file = self.file_handle().map_err(|e| CoordinatorError::WorkerIo(e.to_string()))?;
        let true_len = self.true_len.load(Ordering::Acquire);
        let path = self.path.display().to_string();
        tokio::task::spawn_blocking(move || {
            file.set_len(true_len).map_err(|source| IoWorkerError::Truncate {
                path,
                len: true_len,
                source,
            })
        })
        .await
        .map_err(|e| CoordinatorError::WorkerIo(IoWorkerError::TaskJoin(e.to_string()).to_string()))?
        .map_err(|e| CoordinatorError::WorkerIo(e.to_string()))?;

        let Some((mut hasher, mut scratch)) = verify else {
            return Ok(None);
        };
        let mut file = tokio::fs::File::open(&self.path).await.map_err(|source| {
            CoordinatorError::WorkerIo(
                IoWorkerError::Open {
                    path: self.path.display().to_string(),
                    source,
                }
                .to_string(),
            )
        })?;
        loop {
            let n = file
                .read(scratch.memory_mut())
                .await
                .map_err(|source| {
                    CoordinatorError::WorkerIo(
                        IoWorkerError::Read {
                            path: self.path.display().to_string(),
                            offset: 0,
                            source,
                        }
                        .to_string(),
                    )
                })?;
            if n == 0 {
                break;
            }
            scratch.set_valid_len(n);
            hasher.append(scratch.data());
        }
        Ok(Some(hasher.get_hash_and_reset()))
    }
}
