use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use blockcast_core::Buffer;
use blockcast_pipeline::{ContextSlot, CoordinatorError, VerificationHandles, WorkerContext};
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;

use crate::error::IoWorkerError;

/// Reads a file sequentially (as a sequence of block-sized, sector-aligned
/// chunks), recovering each `fill` call's read offset from
/// `buffer.sequence() * buffer.capacity()` rather than an internal cursor —
/// the same contract `ConsumerWorker::drain` documents, generalized to the
/// producer side. Concurrent `fill` calls therefore never race each other
/// onto overlapping regions of the file.
///
/// Built on `std::os::unix::fs::FileExt::read_at` run inside
/// `tokio::task::spawn_blocking`, rather than maintaining a shared seek
/// cursor, since positioned reads are what make `max_concurrency() > 1`
/// safe in the first place.
pub struct FileProducerWorker {
    path: PathBuf,
    file: OnceCell<Arc<std::fs::File>>,
    context: ContextSlot,
    max_concurrency: usize,
}

impl FileProducerWorker {
    /// Creates a worker that will read `path` once [`initialize`] has run.
    ///
    /// `max_concurrency` bounds how many `fill` calls may run at once;
    /// positioned reads make any value safe, but very large files on
    /// spinning disks may see better throughput from a smaller number.
    ///
    /// [`initialize`]: blockcast_pipeline::ProducerWorker::initialize
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_concurrency: usize) -> Self {
        Self {
            path: path.into(),
            file: OnceCell::new(),
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

impl blockcast_pipeline::ProducerWorker for FileProducerWorker {
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
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(&path))
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

    async fn fill(&self, buffer: &mut Buffer) -> Result<usize, CoordinatorError> {
        if self.context.get().is_canceled() {
            return Err(CoordinatorError::Canceled);
        }
        let file = self.file_handle().map_err(|e| CoordinatorError::WorkerIo(e.to_string()))?;
        let seq = buffer.sequence();
        let block_size = buffer.capacity();
        let offset = seq * block_size as u64;
        let path = self.path.display().to_string();

        let data = tokio::task::spawn_blocking(move || read_exact_at(&file, offset, block_size, &path))
            .await
            .map_err(|e| CoordinatorError::WorkerIo(IoWorkerError::TaskJoin(e.to_string()).to_string()))?
            .map_err(|e| CoordinatorError::WorkerIo(e.to_string()))?;

        let len = data.len();
        buffer.memory_mut()[..len].copy_from_slice(&data);
        Ok(len)
    }

    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<blockcast_core::Digest>, CoordinatorError> {
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

/// Reads up to `len` bytes starting at `offset`, stopping early at EOF
/// (a short final block).
fn read_exact_at(
    file: &std::fs::File,
    offset: u64,
    len: usize,
    path: &str,
) -> Result<Vec<u8>, IoWorkerError> {
    let mut buf = vec![0u8; len];
    let mut total = 0;
    loop {
        let n = file
            .read_at(&mut buf[total..], offset + total as u64)
            .map_err(|source| IoWorkerError::Read {
                path: path.to_string(),
                offset: offset + total as u64,
                source,
            })?;
        if n == 0 {
            break;
        }
        total += n;
        if total == len {
            break;
        }
    }
    buf.truncate(total);
    Ok(buf)
}
