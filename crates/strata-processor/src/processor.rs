use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::config::ProcessorConfig;
use strata_common::{ChunkCoordinate, GenerationError, Result, VoxelChunk, VOXEL_COUNT};
use strata_logger::{log, LogSeverity};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::generator::{AcceleratedGenerator, CpuGenerator, TerrainGenerator};
use crate::handle::{ResultHandle, Waiter};
use crate::spill::SpillCache;

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub batch_size: usize,
    /// Longest a request waits for its batch to fill.
    pub linger: Duration,
    pub workers: usize,
    pub accelerator: bool,
    pub max_resident: usize,
    pub spill_dir: PathBuf,
    pub compression_level: u32,
}

impl ProcessorOptions {
    pub fn from_config(config: &ProcessorConfig, compression_level: u32) -> Self {
        let budget_bytes = config.memory_budget_mb.saturating_mul(1024 * 1024);
        Self {
            batch_size: config.batch_size.max(1),
            linger: Duration::from_millis(config.batch_linger_ms),
            workers: if config.workers == 0 {
                num_cpus::get()
            } else {
                config.workers
            },
            accelerator: config.accelerator,
            max_resident: (budget_bytes / VOXEL_COUNT).max(1),
            spill_dir: config.spill_dir.clone(),
            compression_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub pending: usize,
    pub batches_processed: u64,
    pub chunks_generated: u64,
    pub accelerator_fallbacks: u64,
    pub resident: usize,
    pub spilled: usize,
    pub accelerated: bool,
    pub running: bool,
}

type Batch = Vec<(ChunkCoordinate, Vec<Waiter>)>;

/// Outstanding requests per coordinate, in arrival order of each coordinate.
#[derive(Default)]
struct PendingMap {
    requests: HashMap<ChunkCoordinate, Vec<Waiter>>,
    order: VecDeque<(ChunkCoordinate, Instant)>,
    total: usize,
}

impl PendingMap {
    fn push(&mut self, coord: ChunkCoordinate, waiter: Waiter) {
        let waiters = self.requests.entry(coord.clone()).or_default();
        if waiters.is_empty() {
            self.order.push_back((coord, Instant::now()));
        }
        waiters.push(waiter);
        self.total += 1;
    }

    fn oldest_age(&self) -> Option<Duration> {
        self.order.front().map(|(_, since)| since.elapsed())
    }

    fn drain(&mut self, max: usize) -> Batch {
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some((coord, _)) = self.order.pop_front() else {
                break;
            };
            if let Some(waiters) = self.requests.remove(&coord) {
                self.total -= waiters.len();
                batch.push((coord, waiters));
            }
        }
        batch
    }

    fn clear(&mut self) -> usize {
        let dropped = self.total;
        self.requests.clear();
        self.order.clear();
        self.total = 0;
        dropped
    }
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    generated: AtomicU64,
    fallbacks: AtomicU64,
}

struct Inner {
    options: ProcessorOptions,
    pending: Mutex<PendingMap>,
    batch_tx: mpsc::UnboundedSender<Batch>,
    cpu: Arc<dyn TerrainGenerator>,
    accelerator: Mutex<Option<Arc<dyn TerrainGenerator>>>,
    workers: Arc<Semaphore>,
    spill: SpillCache,
    cancel: CancellationToken,
    counters: Counters,
}

/// Batching chunk generator.
///
/// Requests for the same coordinate made before their batch fires share one
/// generation call. A batch fires once `batch_size` requests are pending, once
/// the oldest has waited `linger`, or on [`ChunkProcessor::flush`].
pub struct ChunkProcessor {
    inner: Arc<Inner>,
    batch_rx: Mutex<Option<mpsc::UnboundedReceiver<Batch>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkProcessor {
    /// Probes the accelerated path when enabled and opens the spill cache.
    pub async fn open(options: ProcessorOptions) -> Result<Self> {
        let accelerator = if options.accelerator {
            AcceleratedGenerator::probe(options.workers)
                .map(|generator| Arc::new(generator) as Arc<dyn TerrainGenerator>)
        } else {
            None
        };
        Self::with_generators(options, Arc::new(CpuGenerator), accelerator).await
    }

    pub async fn with_generators(
        options: ProcessorOptions,
        cpu: Arc<dyn TerrainGenerator>,
        accelerator: Option<Arc<dyn TerrainGenerator>>,
    ) -> Result<Self> {
        let spill = SpillCache::open(
            &options.spill_dir,
            options.max_resident,
            options.compression_level,
        )
        .await?;
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            pending: Mutex::new(PendingMap::default()),
            batch_tx,
            cpu,
            accelerator: Mutex::new(accelerator),
            workers: Arc::new(Semaphore::new(options.workers.max(1))),
            spill,
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            options,
        };

        Ok(Self {
            inner: Arc::new(inner),
            batch_rx: Mutex::new(Some(batch_rx)),
            consumer: Mutex::new(None),
        })
    }

    /// Spawns the batch consumer. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return;
        }
        if self.inner.cancel.is_cancelled() {
            log(
                "Chunk processor was stopped and cannot be restarted".to_string(),
                LogSeverity::Warning,
            );
            return;
        }
        let Some(rx) = self.batch_rx.lock().await.take() else {
            return;
        };

        let inner = self.inner.clone();
        *consumer = Some(tokio::spawn(async move { inner.consume(rx).await }));
        log(
            format!(
                "Chunk processor started (batch size {}, {} workers, accelerated: {})",
                self.inner.options.batch_size,
                self.inner.options.workers,
                self.is_accelerated().await
            ),
            LogSeverity::Info,
        );
    }

    /// Cancels the consumer and resolves every outstanding handle with
    /// [`GenerationError::Cancelled`].
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let dropped = self.inner.pending.lock().await.clear();

        if let Some(consumer) = self.consumer.lock().await.take() {
            if let Err(e) = consumer.await {
                log(format!("Chunk consumer ended abnormally: {}", e), LogSeverity::Error);
            }
        }
        self.batch_rx.lock().await.take();
        self.inner.workers.close();
        self.inner.accelerator.lock().await.take();

        if let Err(e) = self.inner.spill.save_index().await {
            log(format!("Failed to save spill index: {}", e), LogSeverity::Error);
        }
        log(
            format!("Chunk processor stopped ({} pending requests cancelled)", dropped),
            LogSeverity::Info,
        );
    }

    pub async fn process_chunk(&self, coord: ChunkCoordinate) -> ResultHandle {
        if let Some(chunk) = self.inner.spill.get(&coord).await {
            return ResultHandle::ready(Ok(chunk));
        }

        let (waiter, handle) = ResultHandle::channel();
        let batch = {
            let mut pending = self.inner.pending.lock().await;
            // Checked under the lock so a concurrent stop cannot miss this request.
            if self.inner.cancel.is_cancelled() {
                return ResultHandle::ready(Err(GenerationError::Cancelled));
            }
            pending.push(coord, waiter);
            if pending.total >= self.inner.options.batch_size {
                pending.drain(self.inner.options.batch_size)
            } else {
                Vec::new()
            }
        };

        self.inner.dispatch(batch);
        handle
    }

    /// Forms batches from everything pending. Returns the number of coordinates.
    pub async fn flush(&self) -> usize {
        let batches = {
            let mut pending = self.inner.pending.lock().await;
            let mut batches = Vec::new();
            while pending.total > 0 {
                batches.push(pending.drain(self.inner.options.batch_size));
            }
            batches
        };
        let count = batches.iter().map(Vec::len).sum();
        for batch in batches {
            self.inner.dispatch(batch);
        }
        count
    }

    pub async fn is_accelerated(&self) -> bool {
        self.inner.accelerator.lock().await.is_some()
    }

    pub async fn stats(&self) -> ProcessorStats {
        let pending = self.inner.pending.lock().await.total;
        let (resident, spilled) = self.inner.spill.counts().await;
        let counters = &self.inner.counters;
        ProcessorStats {
            pending,
            batches_processed: counters.batches.load(Ordering::Relaxed),
            chunks_generated: counters.generated.load(Ordering::Relaxed),
            accelerator_fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            resident,
            spilled,
            accelerated: self.is_accelerated().await,
            running: self.consumer.lock().await.is_some(),
        }
    }
}

impl Drop for ChunkProcessor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn dispatch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        // A closed queue drops the batch, which cancels its handles.
        let _ = self.batch_tx.send(batch);
    }

    async fn flush_lingering(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            match pending.oldest_age() {
                Some(age) if age >= self.options.linger => pending.drain(self.options.batch_size),
                _ => return,
            }
        };
        self.dispatch(batch);
    }

    async fn consume(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Batch>) {
        let period = (self.options.linger / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.run_batch(batch) => {}
                    },
                    None => break,
                },
                _ = ticker.tick() => self.flush_lingering().await,
            }
        }
    }

    async fn run_batch(&self, batch: Batch) {
        let started = Instant::now();
        let coords: Vec<ChunkCoordinate> = batch.iter().map(|(coord, _)| coord.clone()).collect();
        let result = self.generate(&coords).await;
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(chunks) => {
                self.counters
                    .generated
                    .fetch_add(chunks.len() as u64, Ordering::Relaxed);
                for ((coord, waiters), chunk) in batch.into_iter().zip(chunks) {
                    let chunk = Arc::new(chunk);
                    // Resident before anyone hears about it, so repeats hit memory.
                    self.spill.insert(coord, chunk.clone()).await;
                    for waiter in waiters {
                        let _ = waiter.send(Ok(chunk.clone()));
                    }
                }
                log(
                    format!(
                        "Processed batch of {} chunks in {:.3}s",
                        coords.len(),
                        started.elapsed().as_secs_f64()
                    ),
                    LogSeverity::Debug,
                );
            }
            Err(e) => {
                log(format!("Error processing batch: {}", e), LogSeverity::Error);
                for (_, waiters) in batch {
                    for waiter in waiters {
                        let _ = waiter.send(Err(e.clone()));
                    }
                }
            }
        }
    }

    async fn generate(&self, coords: &[ChunkCoordinate]) -> std::result::Result<Vec<VoxelChunk>, GenerationError> {
        let accelerator = self.accelerator.lock().await.clone();
        if let Some(accelerator) = accelerator {
            let batch = coords.to_vec();
            match tokio::task::spawn_blocking(move || accelerator.generate_batch(&batch)).await {
                Ok(Ok(chunks)) if chunks.len() == coords.len() => return Ok(chunks),
                Ok(Ok(chunks)) => log(
                    format!(
                        "Accelerated generation returned {} chunks for {} coordinates, falling back",
                        chunks.len(),
                        coords.len()
                    ),
                    LogSeverity::Warning,
                ),
                Ok(Err(e)) => log(
                    format!("Accelerated generation failed, falling back: {}", e),
                    LogSeverity::Warning,
                ),
                Err(e) => log(
                    format!("Accelerated generation panicked, falling back: {}", e),
                    LogSeverity::Warning,
                ),
            }
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.generate_on_workers(coords).await
    }

    async fn generate_on_workers(
        &self,
        coords: &[ChunkCoordinate],
    ) -> std::result::Result<Vec<VoxelChunk>, GenerationError> {
        let jobs = coords.iter().cloned().map(|coord| {
            let cpu = self.cpu.clone();
            let workers = self.workers.clone();
            async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(GenerationError::Cancelled),
                };
                match tokio::task::spawn_blocking(move || cpu.generate(&coord)).await {
                    Ok(result) => result,
                    Err(e) => Err(GenerationError::Worker(e.to_string())),
                }
            }
        });
        join_all(jobs).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use strata_common::Block;
    use tempfile::TempDir;
    use tokio_test::{assert_pending, task};

    struct CountingGenerator {
        calls: AtomicUsize,
        fail: Option<GenerationError>,
        accelerated: bool,
    }

    impl CountingGenerator {
        fn new(fail: Option<GenerationError>, accelerated: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                accelerated,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TerrainGenerator for CountingGenerator {
        fn generate(&self, _coord: &ChunkCoordinate) -> std::result::Result<VoxelChunk, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.fail {
                return Err(e.clone());
            }
            let mut chunk = VoxelChunk::new();
            chunk.set(0, 0, 0, Block::Stone);
            Ok(chunk)
        }

        fn is_accelerated(&self) -> bool {
            self.accelerated
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn options(dir: &TempDir, batch_size: usize, linger_ms: u64) -> ProcessorOptions {
        ProcessorOptions {
            batch_size,
            linger: Duration::from_millis(linger_ms),
            workers: 2,
            accelerator: false,
            max_resident: 64,
            spill_dir: dir.path().to_path_buf(),
            compression_level: 6,
        }
    }

    async fn processor(
        dir: &TempDir,
        batch_size: usize,
        linger_ms: u64,
        cpu: Arc<CountingGenerator>,
    ) -> ChunkProcessor {
        let processor = ChunkProcessor::with_generators(options(dir, batch_size, linger_ms), cpu, None)
            .await
            .unwrap();
        processor.start().await;
        processor
    }

    #[tokio::test]
    async fn test_batch_fires_at_threshold_and_shares_duplicates() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let processor = processor(&dir, 4, 60_000, cpu.clone()).await;

        let a = ChunkCoordinate::voxel(0, 0, 0);
        let mut first = processor.process_chunk(a.clone()).await;
        let second = processor.process_chunk(a.clone()).await;
        let other = processor.process_chunk(ChunkCoordinate::voxel(1, 0, 0)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_pending!(task::spawn(&mut first).poll());
        assert_eq!(processor.stats().await.pending, 3);

        let last = processor.process_chunk(ChunkCoordinate::voxel(2, 0, 0)).await;
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        other.await.unwrap();
        last.await.unwrap();

        assert_eq!(cpu.calls(), 3);
        let stats = processor.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.chunks_generated, 3);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_lone_request_resolves_after_linger() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let processor = processor(&dir, 100, 10, cpu.clone()).await;

        let handle = processor.process_chunk(ChunkCoordinate::voxel(5, 5, 5)).await;
        let chunk = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.get(0, 0, 0), Block::Stone.code());
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_flush_forms_batch_on_demand() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let processor = processor(&dir, 100, 60_000, cpu.clone()).await;

        let a = processor.process_chunk(ChunkCoordinate::voxel(0, 1, 0)).await;
        let b = processor.process_chunk(ChunkCoordinate::voxel(0, 2, 0)).await;
        assert_eq!(processor.flush().await, 2);
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(cpu.calls(), 2);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_generated_chunks_are_served_from_memory() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let processor = processor(&dir, 1, 60_000, cpu.clone()).await;
        let coord = ChunkCoordinate::voxel(3, 3, 3);

        let first = processor.process_chunk(coord.clone()).await.await.unwrap();
        let again = processor.process_chunk(coord).await.await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cpu.calls(), 1);
        assert_eq!(processor.stats().await.resident, 1);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_worker_error_reaches_every_handle() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(Some(GenerationError::Worker("boom".into())), false);
        let processor = processor(&dir, 2, 60_000, cpu).await;

        let a = processor.process_chunk(ChunkCoordinate::voxel(0, 0, 0)).await;
        let b = processor.process_chunk(ChunkCoordinate::voxel(0, 0, 0)).await;
        assert_matches!(a.await, Err(GenerationError::Worker(_)));
        assert_matches!(b.await, Err(GenerationError::Worker(_)));
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_accelerator_failure_falls_back_to_workers() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let broken = CountingGenerator::new(Some(GenerationError::Accelerator("lost".into())), true);
        let processor = ChunkProcessor::with_generators(
            options(&dir, 2, 60_000),
            cpu.clone(),
            Some(broken.clone() as Arc<dyn TerrainGenerator>),
        )
        .await
        .unwrap();
        processor.start().await;
        assert!(processor.is_accelerated().await);

        let a = processor.process_chunk(ChunkCoordinate::voxel(0, 0, 0)).await;
        let b = processor.process_chunk(ChunkCoordinate::voxel(1, 0, 0)).await;
        assert!(a.await.is_ok());
        assert!(b.await.is_ok());

        assert_eq!(broken.calls(), 1);
        assert_eq!(cpu.calls(), 2);
        assert_eq!(processor.stats().await.accelerator_fallbacks, 1);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_outstanding_handles() {
        let dir = TempDir::new().unwrap();
        let cpu = CountingGenerator::new(None, false);
        let processor = processor(&dir, 10, 60_000, cpu.clone()).await;

        let pending = processor.process_chunk(ChunkCoordinate::voxel(0, 0, 0)).await;
        processor.stop().await;

        assert_matches!(pending.await, Err(GenerationError::Cancelled));
        assert_matches!(
            processor.process_chunk(ChunkCoordinate::voxel(1, 0, 0)).await.await,
            Err(GenerationError::Cancelled)
        );
        assert!(!processor.stats().await.running);
        assert_eq!(cpu.calls(), 0);
    }

    #[tokio::test]
    async fn test_real_generators_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir, 2, 5);
        opts.accelerator = true;
        let processor = ChunkProcessor::open(opts).await.unwrap();
        processor.start().await;

        let floor = processor.process_chunk(ChunkCoordinate::voxel(0, 0, 0)).await;
        let sky = processor.process_chunk(ChunkCoordinate::voxel(0, 15, 0)).await;
        let floor = floor.await.unwrap();
        let sky = sky.await.unwrap();

        assert_eq!(floor.get(4, 0, 4), Block::Bedrock.code());
        // world y 240..255 is above every surface at these coordinates
        assert!(sky.is_empty());
        processor.stop().await;
    }
}
