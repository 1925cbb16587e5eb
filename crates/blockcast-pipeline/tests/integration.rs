use std::sync::{Arc, Mutex};

use blockcast_core::{Buffer, Digest, HashAlgorithm, SECTOR_SIZE};
use blockcast_pipeline::{
    CompletionOutcome, ConsumerWorker, ContextSlot, CoordinatorError, ProducerWorker,
    TransferCoordinator, VerificationHandles, WorkerContext,
};
use tokio_util::sync::CancellationToken;

/// A producer backed by an in-memory byte slice. Recovers its read offset
/// from `buffer.sequence()` (stamped by the pipeline before `fill` runs)
/// rather than an independent cursor, so concurrent fill tasks never race
/// each other onto the same region of `data`.
struct MemoryProducerWorker {
    data: Vec<u8>,
    context: ContextSlot,
    concurrency: usize,
    fail_at_sequence: Option<u64>,
}

impl MemoryProducerWorker {
    fn new(data: Vec<u8>, concurrency: usize) -> Self {
        Self {
            data,
            context: ContextSlot::new(),
            concurrency,
            fail_at_sequence: None,
        }
    }

    fn failing_at(data: Vec<u8>, concurrency: usize, sequence: u64) -> Self {
        Self {
            data,
            context: ContextSlot::new(),
            concurrency,
            fail_at_sequence: Some(sequence),
        }
    }
}

impl ProducerWorker for MemoryProducerWorker {
    fn max_concurrency(&self) -> usize {
        self.concurrency
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

    async fn fill(&self, buffer: &mut Buffer) -> Result<usize, CoordinatorError> {
        if self.context.get().is_canceled() {
            return Err(CoordinatorError::Canceled);
        }
        let seq = buffer.sequence();
        if self.fail_at_sequence == Some(seq) {
            return Err(CoordinatorError::WorkerIo(format!(
                "injected failure at sequence {seq}"
            )));
        }
        let block_size = buffer.capacity();
        let offset = seq as usize * block_size;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let end = (offset + block_size).min(self.data.len());
        let len = end - offset;
        buffer.memory_mut()[..len].copy_from_slice(&self.data[offset..end]);
        Ok(len)
    }

    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<Digest>, CoordinatorError> {
        hash_via_scratch(verify, &self.data)
    }
}

/// A consumer backed by a growable in-memory buffer. Writes at
/// `sequence() * block_size`, tolerating out-of-order delivery the same way
/// it would against a real file opened with positioned writes.
struct MemoryConsumerWorker {
    data: Arc<Mutex<Vec<u8>>>,
    context: ContextSlot,
    concurrency: usize,
    fail_at_sequence: Option<u64>,
    corrupt_at_sequence: Option<u64>,
}

impl MemoryConsumerWorker {
    fn new(concurrency: usize) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let worker = Self {
            data: Arc::clone(&data),
            context: ContextSlot::new(),
            concurrency,
            fail_at_sequence: None,
            corrupt_at_sequence: None,
        };
        (worker, data)
    }

    fn failing_at(concurrency: usize, sequence: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            context: ContextSlot::new(),
            concurrency,
            fail_at_sequence: Some(sequence),
            corrupt_at_sequence: None,
        }
    }

    fn corrupting_at(concurrency: usize, sequence: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            context: ContextSlot::new(),
            concurrency,
            fail_at_sequence: None,
            corrupt_at_sequence: Some(sequence),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl ConsumerWorker for MemoryConsumerWorker {
    fn max_concurrency(&self) -> usize {
        self.concurrency
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
        let seq = buffer.sequence();
        if self.fail_at_sequence == Some(seq) {
            return Err(CoordinatorError::WorkerIo(format!(
                "injected failure at sequence {seq}"
            )));
        }
        let offset = seq as usize * buffer.capacity();
        let mut bytes = buffer.data().to_vec();
        if self.corrupt_at_sequence == Some(seq) {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            }
        }
        let mut guard = self.data.lock().unwrap();
        let end = offset + bytes.len();
        if guard.len() < end {
            guard.resize(end, 0);
        }
        guard[offset..end].copy_from_slice(&bytes);
        Ok(())
    }

    async fn finalize(
        &self,
        verify: Option<VerificationHandles>,
    ) -> Result<Option<Digest>, CoordinatorError> {
        let snapshot = self.snapshot();
        hash_via_scratch(verify, &snapshot)
    }
}

/// Shared re-read-and-hash helper for both mock workers' `finalize`.
fn hash_via_scratch(
    verify: Option<VerificationHandles>,
    own_output: &[u8],
) -> Result<Option<Digest>, CoordinatorError> {
    let Some((mut hasher, mut scratch)) = verify else {
        return Ok(None);
    };
    let mut remaining = own_output;
    while !remaining.is_empty() {
        let n = remaining.len().min(scratch.capacity());
        scratch.memory_mut()[..n].copy_from_slice(&remaining[..n]);
        scratch.set_valid_len(n);
        hasher.append(scratch.data());
        remaining = &remaining[n..];
    }
    Ok(Some(hasher.get_hash_and_reset()))
}

fn make_data(blocks: f64, block_size: usize) -> Vec<u8> {
    let len = (blocks * block_size as f64) as usize;
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn zero_length_stream_completes_with_no_bytes_transferred() {
    let block_size = SECTOR_SIZE;
    let producer = MemoryProducerWorker::new(Vec::new(), 1);
    let coordinator = TransferCoordinator::new(block_size, 4).unwrap();
    coordinator.set_producer(producer);
    let (consumer, output) = MemoryConsumerWorker::new(1);
    coordinator.add_consumer(consumer);
    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(outcome.is_success());
    assert!(output.lock().unwrap().is_empty());
}

#[tokio::test]
async fn exactly_one_block_is_transferred_verbatim() {
    let block_size = SECTOR_SIZE;
    let data = make_data(1.0, block_size);
    let producer = MemoryProducerWorker::new(data.clone(), 1);
    let (consumer, output) = MemoryConsumerWorker::new(1);
    let coordinator = TransferCoordinator::new(block_size, 4).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer);
    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(*output.lock().unwrap(), data);
}

#[tokio::test]
async fn short_last_block_is_preserved() {
    let block_size = SECTOR_SIZE;
    let data = make_data(2.5, block_size);
    let producer = MemoryProducerWorker::new(data.clone(), 1);
    let (consumer, output) = MemoryConsumerWorker::new(1);
    let coordinator = TransferCoordinator::new(block_size, 4).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer);
    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(*output.lock().unwrap(), data);
}

/// Runs the same data through every (P, C) concurrency combination the
/// invariant of strict output ordering must hold under, verifying the
/// consumer's reconstructed bytes match the source exactly in every case.
#[tokio::test]
async fn concurrency_combinations_preserve_order_and_content() {
    let block_size = SECTOR_SIZE;
    let data = make_data(37.3, block_size);

    for &(producers, consumers) in &[(1, 1), (4, 1), (1, 4), (4, 4)] {
        let coordinator = TransferCoordinator::new(block_size, 16).unwrap();
        coordinator.set_producer(MemoryProducerWorker::new(data.clone(), producers));
        let (consumer, output) = MemoryConsumerWorker::new(consumers);
        coordinator.add_consumer(consumer);

        let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
        assert!(
            outcome.is_success(),
            "P={producers} C={consumers} did not succeed: {outcome:?}"
        );
        assert_eq!(
            *output.lock().unwrap(),
            data,
            "P={producers} C={consumers} reconstructed the wrong bytes"
        );
    }
}

#[tokio::test]
async fn injected_producer_io_error_surfaces_as_failed_outcome() {
    let block_size = SECTOR_SIZE;
    let data = make_data(10.0, block_size);
    let producer = MemoryProducerWorker::failing_at(data, 1, 5);
    let (consumer, _output) = MemoryConsumerWorker::new(1);

    let coordinator = TransferCoordinator::new(block_size, 8).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer);
    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();

    assert!(!outcome.is_success());
    match outcome {
        CompletionOutcome::Failed(err) => {
            assert!(!err.is_canceled());
        }
        CompletionOutcome::Aggregated(errs) => {
            assert!(errs.iter().any(|e| !e.is_canceled()));
        }
        other => panic!("expected a real failure, got {other:?}"),
    }
}

#[tokio::test]
async fn injected_consumer_corruption_is_caught_by_verification() {
    let block_size = SECTOR_SIZE;
    let data = make_data(6.0, block_size);
    let producer = MemoryProducerWorker::new(data, 1);
    let consumer = MemoryConsumerWorker::corrupting_at(1, 3);

    let coordinator = TransferCoordinator::new(block_size, 8).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer);
    coordinator.set_hasher_factory(HashAlgorithm::Sha256.factory());
    coordinator.set_verify_hash(true);

    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(!outcome.is_success());
    let mismatch_found = match outcome {
        CompletionOutcome::Failed(err) => matches!(err, CoordinatorError::HashVerificationMismatch),
        CompletionOutcome::Aggregated(errs) => errs
            .iter()
            .any(|e| matches!(e, CoordinatorError::HashVerificationMismatch)),
        _ => false,
    };
    assert!(mismatch_found, "expected a hash verification mismatch");
}

#[tokio::test]
async fn verified_transfer_with_no_corruption_succeeds_and_records_reference_hash() {
    let block_size = SECTOR_SIZE;
    let data = make_data(4.0, block_size);
    let producer = MemoryProducerWorker::new(data, 2);
    let (consumer, _output) = MemoryConsumerWorker::new(2);

    let coordinator = TransferCoordinator::new(block_size, 8).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer);
    coordinator.set_hasher_factory(HashAlgorithm::Sha256.factory());
    coordinator.set_verify_hash(true);

    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert!(coordinator.reference_hash().is_some());
}

/// Three real consumers (distinct `max_concurrency` values, matching the
/// fast-hash fan-out scenario) must each receive the full, identical byte
/// stream, and — since a per-worker verification mismatch would surface as a
/// failed outcome rather than `Success` — a successful outcome here means
/// every consumer's own verification digest matched the reference digest.
#[tokio::test]
async fn multiple_consumers_all_receive_identical_verified_data() {
    let block_size = SECTOR_SIZE;
    let data = make_data(256.0, block_size);
    let producer = MemoryProducerWorker::new(data.clone(), 1);
    let (consumer_a, output_a) = MemoryConsumerWorker::new(1);
    let (consumer_b, output_b) = MemoryConsumerWorker::new(6);
    let (consumer_c, output_c) = MemoryConsumerWorker::new(6);

    let coordinator = TransferCoordinator::new(block_size, 16).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(consumer_a);
    coordinator.add_consumer(consumer_b);
    coordinator.add_consumer(consumer_c);
    coordinator.set_hasher_factory(HashAlgorithm::XxHash64.factory());
    coordinator.set_verify_hash(true);

    let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert!(coordinator.reference_hash().is_some());
    assert_eq!(*output_a.lock().unwrap(), data, "consumer a diverged");
    assert_eq!(*output_b.lock().unwrap(), data, "consumer b diverged");
    assert_eq!(*output_c.lock().unwrap(), data, "consumer c diverged");
}

#[tokio::test]
async fn capacity_too_small_for_verification_is_rejected_up_front() {
    let block_size = SECTOR_SIZE;
    let data = make_data(1.0, block_size);
    let producer = MemoryProducerWorker::new(data, 1);

    // Two real consumers plus the reference hasher need capacity >= 3.
    let coordinator = TransferCoordinator::new(block_size, 2).unwrap();
    coordinator.set_producer(producer);
    coordinator.add_consumer(MemoryConsumerWorker::new(1).0);
    coordinator.add_consumer(MemoryConsumerWorker::new(1).0);
    coordinator.set_hasher_factory(HashAlgorithm::Sha256.factory());
    coordinator.set_verify_hash(true);

    let err = coordinator
        .execute(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn missing_consumer_is_rejected() {
    let coordinator = TransferCoordinator::new(SECTOR_SIZE, 4).unwrap();
    coordinator.set_producer(MemoryProducerWorker::new(Vec::new(), 1));
    let err = coordinator
        .execute(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidConfiguration(_)));
}
