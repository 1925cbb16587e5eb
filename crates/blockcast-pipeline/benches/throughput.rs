use std::sync::Mutex;

use blockcast_core::Buffer;
use blockcast_pipeline::{
    ConsumerWorker, ContextSlot, CoordinatorError, ProducerWorker, TransferCoordinator,
    VerificationHandles, WorkerContext,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const BLOCK_SIZE: usize = 64 * 1024;
const STREAM_BLOCKS: usize = 256;

struct MemoryProducer {
    data: Vec<u8>,
    context: ContextSlot,
    concurrency: usize,
}

impl ProducerWorker for MemoryProducer {
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
        let offset = buffer.sequence() as usize * buffer.capacity();
        if offset >= self.data.len() {
            return Ok(0);
        }
        let end = (offset + buffer.capacity()).min(self.data.len());
        let len = end - offset;
        buffer.memory_mut()[..len].copy_from_slice(&self.data[offset..end]);
        Ok(len)
    }

    async fn finalize(
        &self,
        _verify: Option<VerificationHandles>,
    ) -> Result<Option<blockcast_core::Digest>, CoordinatorError> {
        Ok(None)
    }
}

struct MemoryConsumer {
    data: Mutex<Vec<u8>>,
    context: ContextSlot,
    concurrency: usize,
}

impl ConsumerWorker for MemoryConsumer {
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
        let offset = buffer.sequence() as usize * buffer.capacity();
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + buffer.valid_len() {
            data.resize(offset + buffer.valid_len(), 0);
        }
        data[offset..offset + buffer.valid_len()].copy_from_slice(buffer.data());
        Ok(())
    }

    async fn finalize(
        &self,
        _verify: Option<VerificationHandles>,
    ) -> Result<Option<blockcast_core::Digest>, CoordinatorError> {
        Ok(None)
    }
}

/// Sweeps producer/consumer concurrency pairs and reports the total bytes
/// moved through `TransferCoordinator` per pair, the same shape as a
/// channel-throughput benchmark but over the pool-gated async pipeline
/// instead of a raw lock-free channel.
fn bench_transfer(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let total_len = BLOCK_SIZE * STREAM_BLOCKS;
    let source: Vec<u8> = (0..total_len).map(|i| (i % 251) as u8).collect();

    let mut group = c.benchmark_group("transfer");
    group.throughput(Throughput::Bytes(total_len as u64));

    for &(producers, consumers) in &[(1, 1), (2, 2), (4, 4), (8, 8)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{producers}P_{consumers}C")),
            &(producers, consumers),
            |b, &(producers, consumers)| {
                b.iter(|| {
                    rt.block_on(async {
                        let coordinator =
                            TransferCoordinator::new(BLOCK_SIZE, (producers + consumers) * 2)
                                .unwrap();
                        coordinator.set_producer(MemoryProducer {
                            data: source.clone(),
                            context: ContextSlot::new(),
                            concurrency: producers,
                        });
                        coordinator.add_consumer(MemoryConsumer {
                            data: Mutex::new(Vec::new()),
                            context: ContextSlot::new(),
                            concurrency: consumers,
                        });
                        let outcome = coordinator.execute(CancellationToken::new()).await.unwrap();
                        black_box(outcome.is_success());
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_transfer);
criterion_main!(benches);
