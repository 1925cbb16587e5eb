use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blockcast_core::{Buffer, BufferPool};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorError;
use crate::state_machine::StateMachineCore;
use crate::worker::{ProducerWorkerBoxed, WorkerContext};

struct SequencedEntry {
    sequence: u64,
    buffer: Buffer,
}

impl PartialEq for SequencedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}
impl Eq for SequencedEntry {}
impl PartialOrd for SequencedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SequencedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

/// The producer's reorder buffer: a min-heap keyed on sequence number, plus
/// the running drain cursor and the sequence of the short/EOS block (if any
/// has been seen yet), used to assert that no full-sized block is broadcast
/// after a short one. Guarded by a plain mutex, never held across an
/// `.await`.
struct ReorderState {
    heap: BinaryHeap<Reverse<SequencedEntry>>,
    next_to_broadcast: u64,
    short_block_sequence: Option<u64>,
}

impl ReorderState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_to_broadcast: 0,
            short_block_sequence: None,
        }
    }
}

/// Owns up to `P` concurrent fill tasks that together produce a strictly
/// ordered, broadcast stream of buffers terminated by channel closure (EOS).
///
/// Grounded on the host's `async_bridge.rs` task-pool shape (a fixed set of
/// tasks sharing one `Arc`-wrapped worker), generalized here to restore
/// strict ordering via a mutex-guarded reorder heap before fan-out, following
/// `batch_processor.rs`'s separation of a synchronous core from the
/// concurrency living at the edges.
pub(crate) struct ProducerStateMachine {
    core: Arc<StateMachineCore>,
    pool: BufferPool,
    worker: Arc<dyn ProducerWorkerBoxed>,
    block_size: usize,
}

impl ProducerStateMachine {
    pub(crate) fn new(
        pool: BufferPool,
        worker: Arc<dyn ProducerWorkerBoxed>,
        global: &CancellationToken,
    ) -> Self {
        let block_size = pool.block_size();
        Self {
            core: Arc::new(StateMachineCore::new(global)),
            pool,
            worker,
            block_size,
        }
    }

    pub(crate) fn core(&self) -> &Arc<StateMachineCore> {
        &self.core
    }

    pub(crate) fn worker(&self) -> &Arc<dyn ProducerWorkerBoxed> {
        &self.worker
    }

    pub(crate) fn context(&self) -> WorkerContext {
        WorkerContext::new(self.block_size, self.core.cancellation().clone())
    }

    fn max_concurrency(&self) -> usize {
        self.worker.max_concurrency().max(1)
    }

    /// Runs the fill/reorder/broadcast loop to completion. Dropping
    /// `consumer_senders` and `reference_hasher_sender` at the end closes
    /// every channel, which is the EOS signal consumers watch for. Errors
    /// are recorded on `self.core`, not returned.
    pub(crate) async fn run_body(
        &self,
        consumer_senders: Vec<mpsc::UnboundedSender<Buffer>>,
        reference_hasher_sender: Option<mpsc::UnboundedSender<Buffer>>,
    ) {
        let sequence = Arc::new(AtomicU64::new(0));
        let reorder = Arc::new(Mutex::new(ReorderState::new()));

        let mut tasks = JoinSet::new();
        for _ in 0..self.max_concurrency() {
            let worker = Arc::clone(&self.worker);
            let pool = self.pool.clone();
            let core = Arc::clone(&self.core);
            let sequence = Arc::clone(&sequence);
            let reorder = Arc::clone(&reorder);
            let consumer_senders = consumer_senders.clone();
            let reference_hasher_sender = reference_hasher_sender.clone();
            tasks.spawn(fill_task(
                worker,
                pool,
                core,
                sequence,
                reorder,
                consumer_senders,
                reference_hasher_sender,
            ));
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

        // Drain any buffers stuck in the reorder heap: only possible if a
        // sibling task failed before the sequence number it was waiting on
        // ever arrived. Dropping each entry returns its buffer to the pool.
        let leftover = std::mem::take(&mut reorder.lock().unwrap().heap);
        drop(leftover);

        drop(consumer_senders);
        drop(reference_hasher_sender);
    }
}

#[allow(clippy::too_many_arguments)]
async fn fill_task(
    worker: Arc<dyn ProducerWorkerBoxed>,
    pool: BufferPool,
    core: Arc<StateMachineCore>,
    sequence: Arc<AtomicU64>,
    reorder: Arc<Mutex<ReorderState>>,
    consumer_senders: Vec<mpsc::UnboundedSender<Buffer>>,
    reference_hasher_sender: Option<mpsc::UnboundedSender<Buffer>>,
) -> Result<(), CoordinatorError> {
    loop {
        if core.cancellation().is_cancelled() {
            return Err(CoordinatorError::Canceled);
        }

        // Suspension point 1: acquire a buffer (cancellable).
        let mut buffer = pool.rent(Some(core.cancellation())).await?;

        // Claim the next sequence number; no two tasks can claim the same
        // one because the counter is atomic.
        let seq = sequence.fetch_add(1, Ordering::AcqRel);
        buffer.set_sequence(seq);

        // Suspension point 2: fill (cancellable; the worker is contractually
        // required to check cancellation itself).
        let len = worker.fill(&mut buffer).await?;

        if len == 0 {
            // EOS for this task. `buffer` drops here, returning to the pool.
            return Ok(());
        }
        buffer.set_valid_len(len);

        let ready = {
            let mut state = reorder.lock().unwrap();
            if let Some(short_seq) = state.short_block_sequence {
                debug_assert!(
                    seq <= short_seq,
                    "producer contract violated: block {seq} follows short block {short_seq}"
                );
            }
            if len < pool.block_size() {
                state.short_block_sequence = Some(seq);
            }
            state
                .heap
                .push(Reverse(SequencedEntry { sequence: seq, buffer }));

            let mut ready = Vec::new();
            while let Some(Reverse(top)) = state.heap.peek() {
                if top.sequence == state.next_to_broadcast {
                    let Reverse(entry) = state.heap.pop().expect("just peeked");
                    state.next_to_broadcast += 1;
                    ready.push(entry);
                } else {
                    break;
                }
            }
            ready
        };

        for entry in ready {
            // Checked after removal from the queue, before broadcast.
            if core.cancellation().is_cancelled() {
                // `entry.buffer` drops here, returning to the pool.
                return Err(CoordinatorError::Canceled);
            }
            broadcast(entry.buffer, &consumer_senders, reference_hasher_sender.as_ref());
        }
    }
}

/// Hands `buffer` to every consumer sender and the optional reference-hasher
/// sender, raising the refcount to exactly `(# consumers) + (1 if reference
/// hasher)` by cloning for every recipient but the last, which receives the
/// original handle. If a send fails (the receiving state machine has already
/// shut down), the returned buffer is simply dropped, releasing it back to
/// the pool.
fn broadcast(
    buffer: Buffer,
    consumer_senders: &[mpsc::UnboundedSender<Buffer>],
    reference_hasher_sender: Option<&mpsc::UnboundedSender<Buffer>>,
) {
    let mut recipients: Vec<&mpsc::UnboundedSender<Buffer>> = consumer_senders.iter().collect();
    if let Some(reference) = reference_hasher_sender {
        recipients.push(reference);
    }

    let mut buffer = Some(buffer);
    let mut iter = recipients.into_iter().peekable();
    while let Some(sender) = iter.next() {
        let handle = if iter.peek().is_some() {
            buffer.as_ref().expect("buffer taken before last recipient").clone()
        } else {
            buffer.take().expect("buffer taken twice")
        };
        let _ = sender.send(handle);
    }
}
