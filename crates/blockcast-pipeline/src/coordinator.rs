use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blockcast_core::{Buffer, BufferPool, BufferPoolConfig, Digest, Hasher, HasherFactory};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::consumer::ConsumerStateMachine;
use crate::error::{CompletionOutcome, CoordinatorError};
use crate::producer::ProducerStateMachine;
use crate::worker::{
    ConsumerWorker, ConsumerWorkerBoxed, ContextSlot, ProducerWorker, ProducerWorkerBoxed,
    VerificationHandles, WorkerContext,
};

/// A synthetic consumer fed by the same broadcast as every real consumer;
/// its `finalize` produces the reference digest the transfer is checked
/// against. Never itself subject to two-pass verification.
struct ReferenceHasherWorker {
    hasher: Mutex<Box<dyn Hasher>>,
    context: ContextSlot,
}

impl ReferenceHasherWorker {
    fn new(factory: &HasherFactory) -> Self {
        Self {
            hasher: Mutex::new(factory()),
            context: ContextSlot::new(),
        }
    }
}

impl ConsumerWorker for ReferenceHasherWorker {
    fn max_concurrency(&self) -> usize {
        1
    }

    fn attach(&self, context: WorkerContext) {
        self.context.attach(context);
    }

    fn detach(&self) {
        self.context.detach();
    }

    async fn initialize(&self) -> Result<(), CoordinatorError> {
        Ok(())
    }

    async fn drain(&self, buffer: &Buffer) -> Result<(), CoordinatorError> {
        self.hasher.lock().unwrap().append(buffer.data());
        Ok(())
    }

    async fn finalize(
        &self,
        _verify: Option<VerificationHandles>,
    ) -> Result<Option<Digest>, CoordinatorError> {
        Ok(Some(self.hasher.lock().unwrap().get_hash_and_reset()))
    }
}

/// Broadcasts the reference digest (or its failure) to every other worker's
/// verification step. Built on `tokio::sync::watch` rather than a oneshot
/// because up to `1 + consumers.len()` independent awaiters need the same
/// value, regardless of whether they started waiting before or after it was
/// set.
struct ReferenceDigestCell {
    sender: watch::Sender<Option<Result<Digest, CoordinatorError>>>,
}

impl ReferenceDigestCell {
    fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self { sender }
    }

    fn set(&self, result: Result<Digest, CoordinatorError>) {
        let _ = self.sender.send(Some(result));
    }

    async fn wait(&self) -> Result<Digest, CoordinatorError> {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(result) = receiver.borrow().clone() {
                return result;
            }
            if receiver.changed().await.is_err() {
                return Err(CoordinatorError::Invariant(
                    "reference hasher result was never produced".to_string(),
                ));
            }
        }
    }

    /// Non-blocking read of whatever has been set so far, for recording the
    /// transfer's value of record once every task has finished.
    fn try_get(&self) -> Option<Result<Digest, CoordinatorError>> {
        self.sender.borrow().clone()
    }
}

/// Builds the `(hasher, scratch)` pair a worker's `finalize` needs for its
/// verification pass, and waits for the reference digest along the way.
/// Returns `Ok(None)` when verification doesn't apply to this worker at all.
async fn prepare_verification(
    faulted: bool,
    verify_hash: bool,
    pool: &BufferPool,
    hasher_factory: &Option<HasherFactory>,
    reference_cell: &Option<Arc<ReferenceDigestCell>>,
) -> Result<Option<(VerificationHandles, Digest)>, CoordinatorError> {
    if faulted || !verify_hash {
        return Ok(None);
    }
    let reference_cell = reference_cell
        .as_ref()
        .expect("verify_hash implies a reference digest cell exists");
    let reference_digest = reference_cell.wait().await.map_err(|err| {
        CoordinatorError::HashVerificationReferenceFailed(Box::new(err))
    })?;

    let factory = hasher_factory
        .as_ref()
        .expect("verify_hash implies hasher_factory is set");
    let hasher = factory();
    // Non-cancellable rent (design decision on the scratch buffer): guarantees
    // finalize always runs through to completion even under cancellation.
    let scratch = pool.rent(None).await?;
    Ok(Some(((hasher, scratch), reference_digest)))
}

/// Compares a worker's own verification digest against the reference,
/// translating a mismatch into the named verification-failure error.
fn check_digest_match(
    verification_digest: Option<Digest>,
    reference_digest: Digest,
) -> Result<(), CoordinatorError> {
    match verification_digest {
        Some(digest) if digest == reference_digest => Ok(()),
        _ => Err(CoordinatorError::HashVerificationMismatch),
    }
}

/// Owns the pool and every transfer's producer, consumers, and optional
/// reference hasher; drives startup, two-pass verification, and error
/// escalation.
///
/// Grounded on the host's `AsyncSpanCollector` (owns a background task plus
/// a shutdown handshake, `new()`/`shutdown()` lifecycle) as the template for
/// a struct owning several concurrent tasks it tears down in a fixed order;
/// `resilient_exporter.rs`'s retry wrapper informed keeping verification as
/// a decorator around `finalize` rather than folding it into the worker
/// trait.
pub struct TransferCoordinator {
    pool: BufferPool,
    producer: Mutex<Option<Arc<dyn ProducerWorkerBoxed>>>,
    consumers: Mutex<Vec<Arc<dyn ConsumerWorkerBoxed>>>,
    hasher_factory: Mutex<Option<HasherFactory>>,
    verify_hash: AtomicBool,
    reference_hash: Mutex<Option<Digest>>,
    running: AtomicBool,
    active_cancellation: Mutex<Option<CancellationToken>>,
}

impl TransferCoordinator {
    /// Preallocates the pool. `block_size` must be a positive multiple of
    /// the sector size; `capacity` must be at least 1.
    ///
    /// # Errors
    /// Returns [`CoordinatorError::Core`] wrapping
    /// [`blockcast_core::CoreError::InvalidConfiguration`] if either
    /// precondition fails.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self, CoordinatorError> {
        let config = BufferPoolConfig::new(block_size, capacity)?;
        Ok(Self {
            pool: BufferPool::new(config),
            producer: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            hasher_factory: Mutex::new(None),
            verify_hash: AtomicBool::new(false),
            reference_hash: Mutex::new(None),
            running: AtomicBool::new(false),
            active_cancellation: Mutex::new(None),
        })
    }

    /// Sets the producer worker. Must be called before [`Self::execute`].
    pub fn set_producer<W: ProducerWorker>(&self, worker: W) {
        *self.producer.lock().unwrap() = Some(Arc::new(worker));
    }

    /// Appends a consumer worker. At least one must be set before
    /// [`Self::execute`]; order is preserved.
    pub fn add_consumer<W: ConsumerWorker>(&self, worker: W) {
        self.consumers.lock().unwrap().push(Arc::new(worker));
    }

    /// Sets the hasher factory used for two-pass verification. Required if
    /// [`Self::set_verify_hash`] is set to `true`.
    pub fn set_hasher_factory(&self, factory: HasherFactory) {
        *self.hasher_factory.lock().unwrap() = Some(factory);
    }

    /// Enables or disables hash verification for the next `execute` call.
    pub fn set_verify_hash(&self, verify: bool) {
        self.verify_hash.store(verify, Ordering::Release);
    }

    /// The reference digest computed by the most recently completed
    /// transfer; `None` if verification wasn't requested or the reference
    /// hasher failed.
    #[must_use]
    pub fn reference_hash(&self) -> Option<Digest> {
        self.reference_hash.lock().unwrap().clone()
    }

    /// Fires global cancellation for whatever transfer is currently
    /// running. No-op if nothing is running.
    pub fn cancel(&self) {
        if let Some(token) = self.active_cancellation.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Runs one transfer to completion.
    ///
    /// # Errors
    /// Returns [`CoordinatorError::AlreadyRunning`] on re-entry,
    /// [`CoordinatorError::InvalidConfiguration`] if the producer/consumers/
    /// hasher-factory preconditions aren't met, or
    /// [`CoordinatorError::Invariant`] if the pool isn't at rest before
    /// starting.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
    ) -> Result<CompletionOutcome, CoordinatorError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(CoordinatorError::AlreadyRunning);
        }
        let result = self.execute_inner(cancel).await;
        *self.active_cancellation.lock().unwrap() = None;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn execute_inner(
        &self,
        cancel: CancellationToken,
    ) -> Result<CompletionOutcome, CoordinatorError> {
        let producer = self
            .producer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CoordinatorError::InvalidConfiguration("producer is not set".into()))?;
        let consumers = self.consumers.lock().unwrap().clone();
        if consumers.is_empty() {
            return Err(CoordinatorError::InvalidConfiguration(
                "at least one consumer is required".into(),
            ));
        }
        let verify_hash = self.verify_hash.load(Ordering::Acquire);
        let hasher_factory = self.hasher_factory.lock().unwrap().clone();
        if verify_hash {
            if hasher_factory.is_none() {
                return Err(CoordinatorError::InvalidConfiguration(
                    "verify_hash is set but no hasher_factory was provided".into(),
                ));
            }
            if self.pool.capacity() < 1 + consumers.len() {
                return Err(CoordinatorError::InvalidConfiguration(format!(
                    "pool capacity {} is below the minimum {} (1 + {} consumers) required for verification",
                    self.pool.capacity(),
                    1 + consumers.len(),
                    consumers.len()
                )));
            }
        }

        self.pool.invariant()?;

        let global = cancel.child_token();
        *self.active_cancellation.lock().unwrap() = Some(global.clone());

        let reference_cell = verify_hash.then(|| Arc::new(ReferenceDigestCell::new()));

        let producer_sm = Arc::new(ProducerStateMachine::new(self.pool.clone(), producer, &global));

        let mut consumer_channels = Vec::with_capacity(consumers.len());
        let mut consumer_senders = Vec::with_capacity(consumers.len());
        for worker in &consumers {
            let sm = Arc::new(ConsumerStateMachine::new(&self.pool, Arc::clone(worker), &global));
            let (tx, rx) = mpsc::unbounded_channel();
            consumer_senders.push(tx);
            consumer_channels.push((sm, rx));
        }

        let reference_channel = if let Some(factory) = &hasher_factory {
            if verify_hash {
                let worker: Arc<dyn ConsumerWorkerBoxed> =
                    Arc::new(ReferenceHasherWorker::new(factory));
                let sm = Arc::new(ConsumerStateMachine::new(&self.pool, worker, &global));
                let (tx, rx) = mpsc::unbounded_channel();
                Some((sm, rx, tx))
            } else {
                None
            }
        } else {
            None
        };
        let reference_hasher_sender = reference_channel.as_ref().map(|(_, _, tx)| tx.clone());

        // Start consumers (and the reference hasher) before the producer.
        let faulted_consumers = Arc::new(AtomicUsize::new(0));
        let total_consumers = consumer_channels.len();

        let mut consumer_handles = Vec::with_capacity(consumer_channels.len());
        for (sm, rx) in consumer_channels {
            let pool = self.pool.clone();
            let hasher_factory = hasher_factory.clone();
            let reference_cell = reference_cell.clone();
            let global = global.clone();
            let faulted_consumers = Arc::clone(&faulted_consumers);
            let role = ConsumerRole::Regular {
                verify_hash,
                hasher_factory,
                reference_cell,
            };
            consumer_handles.push(tokio::spawn(async move {
                let outcome = drive_consumer(Arc::clone(&sm), rx, pool, role).await;
                if sm.core().faulted() {
                    eprintln!("Consumer fault: {outcome:?}");
                    if faulted_consumers.fetch_add(1, Ordering::AcqRel) + 1 == total_consumers {
                        global.cancel();
                    }
                }
                outcome
            }));
        }

        let reference_handle = reference_channel.map(|(sm, rx, tx)| {
            drop(tx);
            let pool = self.pool.clone();
            let global = global.clone();
            let cell = Arc::clone(
                reference_cell
                    .as_ref()
                    .expect("reference_channel implies reference_cell was built"),
            );
            tokio::spawn(async move {
                let outcome =
                    drive_consumer(Arc::clone(&sm), rx, pool, ConsumerRole::ReferenceHasher { cell })
                        .await;
                if sm.core().faulted() {
                    eprintln!("Reference hasher fault: {outcome:?}");
                    global.cancel();
                }
                outcome
            })
        });

        let producer_handle = {
            let sm = Arc::clone(&producer_sm);
            let pool = self.pool.clone();
            let hasher_factory = hasher_factory.clone();
            let reference_cell = reference_cell.clone();
            let global = global.clone();
            tokio::spawn(async move {
                let outcome = drive_producer(
                    Arc::clone(&sm),
                    consumer_senders,
                    reference_hasher_sender,
                    pool,
                    verify_hash,
                    hasher_factory,
                    reference_cell,
                )
                .await;
                if sm.core().faulted() {
                    eprintln!("Producer fault: {outcome:?}");
                    global.cancel();
                }
                outcome
            })
        };

        let producer_outcome = producer_handle
            .await
            .unwrap_or_else(|join_err| CompletionOutcome::Failed(CoordinatorError::WorkerIo(join_err.to_string())));

        let mut consumer_outcomes = Vec::with_capacity(consumer_handles.len());
        for handle in consumer_handles {
            consumer_outcomes.push(handle.await.unwrap_or_else(|join_err| {
                CompletionOutcome::Failed(CoordinatorError::WorkerIo(join_err.to_string()))
            }));
        }

        if let Some(handle) = reference_handle {
            let _ = handle.await;
        }

        *self.reference_hash.lock().unwrap() = reference_cell
            .as_ref()
            .and_then(|cell| cell.try_get())
            .and_then(Result::ok);

        self.pool.invariant()?;

        let mut exceptions = Vec::new();
        collect_exceptions(producer_outcome, &mut exceptions);
        for outcome in consumer_outcomes {
            collect_exceptions(outcome, &mut exceptions);
        }
        Ok(CompletionOutcome::from_exceptions(exceptions))
    }
}

fn collect_exceptions(outcome: CompletionOutcome, into: &mut Vec<CoordinatorError>) {
    match outcome {
        CompletionOutcome::Success => {}
        CompletionOutcome::Canceled => into.push(CoordinatorError::Canceled),
        CompletionOutcome::Failed(err) => into.push(err),
        CompletionOutcome::Aggregated(mut errs) => into.append(&mut errs),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_producer(
    sm: Arc<ProducerStateMachine>,
    consumer_senders: Vec<mpsc::UnboundedSender<Buffer>>,
    reference_hasher_sender: Option<mpsc::UnboundedSender<Buffer>>,
    pool: BufferPool,
    verify_hash: bool,
    hasher_factory: Option<HasherFactory>,
    reference_cell: Option<Arc<ReferenceDigestCell>>,
) -> CompletionOutcome {
    let worker = Arc::clone(sm.worker());
    worker.attach(sm.context());

    if let Err(err) = worker.initialize().await {
        sm.core().record(err);
    }

    sm.run_body(consumer_senders, reference_hasher_sender).await;

    let faulted = sm.core().faulted();
    match prepare_verification(faulted, verify_hash, &pool, &hasher_factory, &reference_cell).await
    {
        Ok(Some((handles, reference_digest))) => match worker.finalize(Some(handles)).await {
            Ok(digest) => {
                if let Err(err) = check_digest_match(digest, reference_digest) {
                    sm.core().record(err);
                }
            }
            Err(err) => sm.core().record(err),
        },
        Ok(None) => {
            if let Err(err) = worker.finalize(None).await {
                sm.core().record(err);
            }
        }
        Err(err) => sm.core().record(err),
    }

    worker.detach();
    sm.core().outcome()
}

/// Distinguishes the one synthetic reference-hasher consumer from every
/// real one, so `drive_consumer` knows whether its `finalize` result is a
/// verification digest to compare, or the reference value of record itself.
enum ConsumerRole {
    Regular {
        verify_hash: bool,
        hasher_factory: Option<HasherFactory>,
        reference_cell: Option<Arc<ReferenceDigestCell>>,
    },
    ReferenceHasher {
        cell: Arc<ReferenceDigestCell>,
    },
}

async fn drive_consumer(
    sm: Arc<ConsumerStateMachine>,
    receiver: mpsc::UnboundedReceiver<Buffer>,
    pool: BufferPool,
    role: ConsumerRole,
) -> CompletionOutcome {
    let worker = Arc::clone(sm.worker());
    worker.attach(sm.context());

    if let Err(err) = worker.initialize().await {
        sm.core().record(err);
    }

    sm.run_body(receiver).await;

    let faulted = sm.core().faulted();
    match role {
        ConsumerRole::Regular {
            verify_hash,
            hasher_factory,
            reference_cell,
        } => {
            match prepare_verification(faulted, verify_hash, &pool, &hasher_factory, &reference_cell)
                .await
            {
                Ok(Some((handles, reference_digest))) => match worker.finalize(Some(handles)).await
                {
                    Ok(digest) => {
                        if let Err(err) = check_digest_match(digest, reference_digest) {
                            sm.core().record(err);
                        }
                    }
                    Err(err) => sm.core().record(err),
                },
                Ok(None) => {
                    if let Err(err) = worker.finalize(None).await {
                        sm.core().record(err);
                    }
                }
                Err(err) => sm.core().record(err),
            }
        }
        ConsumerRole::ReferenceHasher { cell } => match worker.finalize(None).await {
            Ok(Some(digest)) => cell.set(Ok(digest)),
            Ok(None) => cell.set(Err(CoordinatorError::Invariant(
                "reference hasher finalize returned no digest".to_string(),
            ))),
            Err(err) => {
                cell.set(Err(err.clone()));
                sm.core().record(err);
            }
        },
    }

    worker.detach();
    sm.core().outcome()
}
