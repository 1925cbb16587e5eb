use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use blockcast_core::{Buffer, Digest, Hasher};
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorError;

/// Non-owning handle a worker uses to query its owning state machine, per the
/// design note on cyclic references: the state machine owns the worker, the
/// worker only ever borrows this back through an explicit attach/detach pair.
///
/// Workers are invoked concurrently (up to `max_concurrency`), so both this
/// handle and the worker trait methods take `&self`; implementations that
/// need mutable state protect it themselves (an atomic cursor, a mutex, or —
/// for genuinely sequential workers — a declared `max_concurrency() == 1`).
#[derive(Clone)]
pub struct WorkerContext {
    block_size: usize,
    cancellation: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(block_size: usize, cancellation: CancellationToken) -> Self {
        Self {
            block_size,
            cancellation,
        }
    }

    /// The pool's fixed block size, equal to every buffer's capacity.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The state machine's internal cancellation scope (linked from global).
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Convenience for a worker that wants a quick check without awaiting.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Slot a worker attaches its [`WorkerContext`] into. Shared helper so every
/// worker implementation doesn't have to hand-roll the same
/// `Mutex<Option<WorkerContext>>`.
#[derive(Default)]
pub struct ContextSlot(Mutex<Option<WorkerContext>>);

impl ContextSlot {
    #[must_use]
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub fn attach(&self, context: WorkerContext) {
        *self.0.lock().unwrap() = Some(context);
    }

    pub fn detach(&self) {
        *self.0.lock().unwrap() = None;
    }

    /// Panics if called outside the execution window (between `attach` and
    /// `detach`) — a worker-implementation bug, not a runtime condition.
    #[must_use]
    pub fn get(&self) -> WorkerContext {
        self.0
            .lock()
            .unwrap()
            .clone()
            .expect("worker method called outside initialize..finalize")
    }
}

/// What a worker's `finalize` is given when hash verification is enabled: a
/// fresh hasher instance and a rented scratch buffer, both owned — the
/// worker re-reads its own output into `scratch`, feeds it to `hasher`, and
/// lets both drop when finalize returns (the hasher's `Box` drop and the
/// scratch `Buffer`'s `Drop`-to-pool release both happen for free).
pub type VerificationHandles = (Box<dyn Hasher>, Buffer);

/// A one-to-many transfer's data source.
///
/// Implemented with native `async fn` in trait; see [`ProducerWorkerBoxed`]
/// for the object-safe adapter the coordinator actually stores.
pub trait ProducerWorker: Send + Sync + 'static {
    /// Maximum number of concurrent `fill` calls. Workers doing unbuffered
    /// sequential I/O must return 1.
    fn max_concurrency(&self) -> usize {
        1
    }

    /// Called once before execution begins.
    fn attach(&self, context: WorkerContext);

    /// Called once after execution ends (success, cancellation, or error).
    fn detach(&self);

    /// Acquire resources. Failure is recorded and cancels this state machine.
    async fn initialize(&self) -> Result<(), CoordinatorError>;

    /// Fill `buffer.memory_mut()` and return the number of bytes written.
    /// Must return exactly `buffer.capacity()` unless this is the last
    /// block, in which case any value in `0..=capacity` is allowed; `0`
    /// signals EOS. May run concurrently up to `max_concurrency`.
    async fn fill(&self, buffer: &mut Buffer) -> Result<usize, CoordinatorError>;

    /// Release resources and, if `verify` is `Some`, re-read this worker's
    /// own output and feed it into the hasher to produce a verification
    /// digest.
    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<Digest>, CoordinatorError>;
}

/// A one-to-many transfer's data sink.
pub trait ConsumerWorker: Send + Sync + 'static {
    /// Maximum number of concurrent `drain` calls. Workers doing unbuffered
    /// sequential I/O must return 1.
    fn max_concurrency(&self) -> usize {
        1
    }

    fn attach(&self, context: WorkerContext);
    fn detach(&self);

    /// Acquire resources. Failure is recorded and cancels this state machine.
    async fn initialize(&self) -> Result<(), CoordinatorError>;

    /// Consume `buffer.data()` completely. The caller (the consumer state
    /// machine) retains ownership of `buffer` and returns it to the pool
    /// immediately after this call, regardless of outcome. Must tolerate
    /// out-of-order delivery when `max_concurrency() > 1` and recover its
    /// file position from `buffer.sequence()`.
    async fn drain(&self, buffer: &Buffer) -> Result<(), CoordinatorError>;

    /// Release resources and, if `verify` is `Some`, re-read this worker's
    /// own output and feed it into the hasher to produce a verification
    /// digest.
    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<Digest>, CoordinatorError>;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe adapter for [`ProducerWorker`], generated by a blanket impl.
/// Mirrors the host workspace's `SpanExporter`/`SpanExporterBoxed` split: the
/// ergonomic trait uses native `async fn`, which isn't dyn-compatible, so the
/// coordinator stores this boxed-future version instead.
pub trait ProducerWorkerBoxed: Send + Sync {
    fn max_concurrency(&self) -> usize;
    fn attach(&self, context: WorkerContext);
    fn detach(&self);
    fn initialize(&self) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    fn fill<'a>(&'a self, buffer: &'a mut Buffer) -> BoxFuture<'a, Result<usize, CoordinatorError>>;
    fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> BoxFuture<'_, Result<Option<Digest>, CoordinatorError>>;
}

impl<T: ProducerWorker + ?Sized> ProducerWorkerBoxed for T {
    fn max_concurrency(&self) -> usize {
        ProducerWorker::max_concurrency(self)
    }

    fn attach(&self, context: WorkerContext) {
        ProducerWorker::attach(self, context);
    }

    fn detach(&self) {
        ProducerWorker::detach(self);
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        Box::pin(ProducerWorker::initialize(self))
    }

    fn fill<'a>(&'a self, buffer: &'a mut Buffer) -> BoxFuture<'a, Result<usize, CoordinatorError>> {
        Box::pin(ProducerWorker::fill(self, buffer))
    }

    fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> BoxFuture<'_, Result<Option<Digest>, CoordinatorError>> {
        Box::pin(ProducerWorker::finalize(self, verify))
    }
}

/// Object-safe adapter for [`ConsumerWorker`]; see [`ProducerWorkerBoxed`].
pub trait ConsumerWorkerBoxed: Send + Sync {
    fn max_concurrency(&self) -> usize;
    fn attach(&self, context: WorkerContext);
    fn detach(&self);
    fn initialize(&self) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    fn drain<'a>(&'a self, buffer: &'a Buffer) -> BoxFuture<'a, Result<(), CoordinatorError>>;
    fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> BoxFuture<'_, Result<Option<Digest>, CoordinatorError>>;
}

impl<T: ConsumerWorker + ?Sized> ConsumerWorkerBoxed for T {
    fn max_concurrency(&self) -> usize {
        ConsumerWorker::max_concurrency(self)
    }

    fn attach(&self, context: WorkerContext) {
        ConsumerWorker::attach(self, context);
    }

    fn detach(&self) {
        ConsumerWorker::detach(self);
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        Box::pin(ConsumerWorker::initialize(self))
    }

    fn drain<'a>(&'a self, buffer: &'a Buffer) -> BoxFuture<'a, Result<(), CoordinatorError>> {
        Box::pin(ConsumerWorker::drain(self, buffer))
    }

    fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> BoxFuture<'_, Result<Option<Digest>, CoordinatorError>> {
        Box::pin(ConsumerWorker::finalize(self, verify))
    }
}
