use std::sync::Arc;

use blockcast_core::{Buffer, BufferPool};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorError;
use crate::state_machine::StateMachineCore;
use crate::worker::{ConsumerWorkerBoxed, WorkerContext};

/// Receives the ordered buffer stream from one producer channel and drives
/// up to `C` concurrent drain tasks against it.
///
/// Generalized from a single-reader, closed-channel-is-EOS stream to `C`
/// pooled readers the same way a batch exporter pools concurrent export
/// tasks off one batch: the shared `tokio::sync::Mutex`-wrapped receiver
/// keeps each task's critical section — one `recv()` — as short as possible.
pub(crate) struct ConsumerStateMachine {
    core: Arc<StateMachineCore>,
    worker: Arc<dyn ConsumerWorkerBoxed>,
    block_size: usize,
}

impl ConsumerStateMachine {
    pub(crate) fn new(
        pool: &BufferPool,
        worker: Arc<dyn ConsumerWorkerBoxed>,
        global: &CancellationToken,
    ) -> Self {
        Self {
            core: Arc::new(StateMachineCore::new(global)),
            worker,
            block_size: pool.block_size(),
        }
    }

    pub(crate) fn core(&self) -> &Arc<StateMachineCore> {
        &self.core
    }

    pub(crate) fn worker(&self) -> &Arc<dyn ConsumerWorkerBoxed> {
        &self.worker
    }

    pub(crate) fn context(&self) -> WorkerContext {
        WorkerContext::new(self.block_size, self.core.cancellation().clone())
    }

    fn max_concurrency(&self) -> usize {
        self.worker.max_concurrency().max(1)
    }

    /// Runs the receive/drain/return loop to completion, then absorbs
    /// anything left in the channel on shutdown. Errors are recorded on
    /// `self.core`, not returned.
    pub(crate) async fn run_body(&self, receiver: mpsc::UnboundedReceiver<Buffer>) {
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let mut tasks = JoinSet::new();
        for _ in 0..self.max_concurrency() {
            let worker = Arc::clone(&self.worker);
            let core = Arc::clone(&self.core);
            let receiver = Arc::clone(&receiver);
            tasks.spawn(drain_task(worker, core, receiver));
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.core.record(err),
                Err(join_err) => {
                    self.core
                        .record(CoordinatorError::WorkerIo(join_err.to_string()));
                }
            }
        }

        // Shutdown: drain to the end and return every remaining buffer,
        // regardless of why the drain tasks stopped (EOS, cancellation, or
        // a worker error that took this state machine down early).
        let mut guard = receiver.lock().await;
        while let Some(buffer) = guard.recv().await {
            drop(buffer);
        }
    }
}

async fn drain_task(
    worker: Arc<dyn ConsumerWorkerBoxed>,
    core: Arc<StateMachineCore>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Buffer>>>,
) -> Result<(), CoordinatorError> {
    loop {
        if core.cancellation().is_cancelled() {
            return Err(CoordinatorError::Canceled);
        }

        // Suspension point: receive the next buffer (cancellable only in the
        // sense that a closed channel — the clean EOS signal — unblocks it).
        let buffer = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        debug_assert!(
            buffer.valid_len() > 0,
            "EOS must never be placed on the channel as a data item"
        );

        if core.cancellation().is_cancelled() {
            // `buffer` drops here, returning to the pool.
            return Err(CoordinatorError::Canceled);
        }

        let result = worker.drain(&buffer).await;
        // Returned to the pool on every path by letting it drop here.
        drop(buffer);
        result?;
    }
}
