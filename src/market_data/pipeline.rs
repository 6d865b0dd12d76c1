//! Tick ingestion: raw gateway tick -> pooled record -> bounded queue -> worker -> pool.
//!
//! Records are partitioned by instrument. Each partition is a bounded FIFO drained
//! by exactly one worker thread, so ticks for one instrument are processed in the
//! order they were enqueued. Every record also carries a pipeline sequence number,
//! assigned under the partition's producer lock, so per-partition queue order and
//! sequence order are the same thing.
//!
//! Nothing here blocks a gateway thread for longer than `acquire_timeout` plus
//! `enqueue_timeout`. When the pool is empty or a queue stays full the oldest
//! queued tick is evicted to make room and the loss is counted.

use std::hash::BuildHasher;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::error::ErrorKind;
use crate::market_data::pool::{AcquirePolicy, PoolConfig, PoolError, PooledRecord, RecordPool};
use crate::market_data::record::{convert, InstrumentId, InstrumentIdError, MarketDataRecord, RawTick};

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Downstream processing of one record (persistence, publish, strategy...).
///
/// Runs on a pipeline worker thread. The record goes back to the pool as soon as
/// this returns, so implementations must copy anything they want to keep.
pub trait TickHandler: Send + Sync + 'static {
    fn handle(&self, record: &MarketDataRecord);
}

impl<F> TickHandler for F
where
    F: Fn(&MarketDataRecord) + Send + Sync + 'static,
{
    fn handle(&self, record: &MarketDataRecord) {
        self(record)
    }
}

/// Logs each record at debug level.
#[derive(Debug, Default)]
pub struct LogHandler;

impl TickHandler for LogHandler {
    fn handle(&self, record: &MarketDataRecord) {
        debug!(
            seq = record.sequence,
            instrument = %record.instrument,
            last = record.last_price,
            volume = record.volume,
            bid = ?record.best_bid(),
            ask = ?record.best_ask(),
            "tick"
        );
    }
}

/// Writes each record as one JSON line.
pub struct JsonLinesHandler<W> {
    out: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLinesHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl<W: Write + Send + 'static> TickHandler for JsonLinesHandler<W> {
    fn handle(&self, record: &MarketDataRecord) {
        let mut out = self.out.lock();
        if let Err(e) = serde_json::to_writer(&mut *out, record) {
            warn!(error = %e, instrument = %record.instrument, "Failed to serialise record");
            return;
        }
        if let Err(e) = out.write_all(b"\n") {
            warn!(error = %e, "Failed to write record");
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of partitions, one worker each.
    pub workers: usize,
    /// Bound of each partition queue.
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(1),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bad tick: {0}")]
    Convert(#[from] InstrumentIdError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("queue of partition {0} is full")]
    QueueFull(usize),
    #[error("pipeline is stopped")]
    Stopped,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Pool(e) => e.kind(),
            IngestError::QueueFull(_) | IngestError::Spawn(_) => ErrorKind::Resource,
            IngestError::Stopped => ErrorKind::StateConflict,
            // the venue handed over something unusable
            IngestError::Convert(_) => ErrorKind::GatewayRejection,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub enqueued: u64,
    pub processed: u64,
    /// Ticks that never reached a queue (pool exhausted, queue full, bad tick).
    pub rejected: u64,
    /// Queued ticks evicted to make room for newer ones.
    pub evicted: u64,
    pub handler_panics: u64,
    pub queued: usize,
    pub latency_p99_us: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    enqueued: AtomicU64,
    processed: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    handler_panics: AtomicU64,
}

struct Queued {
    record: PooledRecord,
    enqueued_at: Instant,
}

struct Partition {
    tx: Sender<Queued>,
    rx: Receiver<Queued>,
    producer: Mutex<()>,
}

pub struct Pipeline {
    pool: RecordPool,
    partitions: Vec<Partition>,
    sequence: AtomicU64,
    counters: Arc<Counters>,
    latency: Arc<Mutex<Option<Histogram<u64>>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hasher: ahash::RandomState,
    enqueue_timeout: Duration,
    evict_on_exhaustion: bool,
}

impl Pipeline {
    /// Build the pool and queues and start one worker per partition.
    pub fn start(config: PipelineConfig, handler: Arc<dyn TickHandler>) -> Result<Self, IngestError> {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let evict_on_exhaustion = config.pool.policy == AcquirePolicy::Block;

        let partitions: Vec<Partition> = (0..workers)
            .map(|_| {
                let (tx, rx) = channel::bounded(queue_capacity);
                Partition { tx, rx, producer: Mutex::new(()) }
            })
            .collect();

        let pipeline = Self {
            pool: RecordPool::new(config.pool),
            partitions,
            sequence: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
            latency: Arc::new(Mutex::new(Histogram::new(3).ok())),
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::with_capacity(workers)),
            hasher: ahash::RandomState::with_seeds(0x6d64, 0x7365, 0x7373, 0x696f),
            enqueue_timeout: config.enqueue_timeout,
            evict_on_exhaustion,
        };

        for (index, partition) in pipeline.partitions.iter().enumerate() {
            let worker = Worker {
                index,
                rx: partition.rx.clone(),
                handler: Arc::clone(&handler),
                counters: Arc::clone(&pipeline.counters),
                latency: Arc::clone(&pipeline.latency),
                running: Arc::clone(&pipeline.running),
            };
            let handle = thread::Builder::new()
                .name(format!("md-worker-{index}"))
                .spawn(move || worker.run())?;
            pipeline.workers.lock().push(handle);
        }

        info!(workers, queue_capacity, "Started ingestion pipeline");
        Ok(pipeline)
    }

    /// Convert and enqueue one tick. Returns the sequence number it was given.
    ///
    /// Called on gateway threads: bounded wait only, failures are counted here and
    /// returned for the caller to log.
    pub fn ingest(&self, raw: &RawTick) -> Result<u64, IngestError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(IngestError::Stopped);
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("md_ticks_received_total").increment(1);

        let mut record = self.acquire_slot()?;
        if let Err(e) = convert(&mut record, raw) {
            self.reject("bad_tick");
            return Err(e.into());
        }
        let partition = self.partition_for(&record.instrument);
        self.enqueue(partition, record)
    }

    pub fn partition_for(&self, instrument: &InstrumentId) -> usize {
        (self.hasher.hash_one(instrument) % self.partitions.len() as u64) as usize
    }

    fn acquire_slot(&self) -> Result<PooledRecord, IngestError> {
        match self.pool.acquire() {
            Ok(record) => Ok(record),
            Err(e) => {
                if self.evict_on_exhaustion && self.evict_oldest().is_some() {
                    if let Some(record) = self.pool.try_acquire() {
                        return Ok(record);
                    }
                }
                self.reject("pool_exhausted");
                Err(e.into())
            }
        }
    }

    // Drop the head of the longest queue so its slot goes back to the pool.
    fn evict_oldest(&self) -> Option<u64> {
        let partition = self.partitions.iter().max_by_key(|p| p.rx.len())?;
        let queued = partition.rx.try_recv().ok()?;
        let seq = queued.record.sequence;
        self.note_eviction(seq);
        Some(seq)
    }

    fn enqueue(&self, index: usize, mut record: PooledRecord) -> Result<u64, IngestError> {
        let partition = &self.partitions[index];
        let _producer = partition.producer.lock();

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        record.sequence = seq;
        let item = Queued { record, enqueued_at: Instant::now() };

        match partition.tx.send_timeout(item, self.enqueue_timeout) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                trace!(seq, partition = index, "Enqueued tick");
                Ok(seq)
            }
            Err(SendTimeoutError::Timeout(item)) => {
                // Keep the newest: evict the partition's oldest and retry once.
                if let Ok(oldest) = partition.rx.try_recv() {
                    self.note_eviction(oldest.record.sequence);
                }
                match partition.tx.try_send(item) {
                    Ok(()) => {
                        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                        Ok(seq)
                    }
                    Err(TrySendError::Full(_)) => {
                        self.reject("queue_full");
                        Err(IngestError::QueueFull(index))
                    }
                    Err(TrySendError::Disconnected(_)) => Err(IngestError::Stopped),
                }
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(IngestError::Stopped),
        }
    }

    fn note_eviction(&self, seq: u64) {
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("md_ticks_dropped_total", "reason" => "evicted").increment(1);
        debug!(seq, "Evicted oldest queued tick");
    }

    fn reject(&self, reason: &'static str) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("md_ticks_dropped_total", "reason" => reason).increment(1);
    }

    pub fn pool(&self) -> &RecordPool {
        &self.pool
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn queued(&self) -> usize {
        self.partitions.iter().map(|p| p.rx.len()).sum()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            received: c.received.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            handler_panics: c.handler_panics.load(Ordering::Relaxed),
            queued: self.queued(),
            latency_p99_us: self
                .latency
                .lock()
                .as_ref()
                .map(|h| h.value_at_quantile(0.99))
                .unwrap_or(0),
        }
    }

    /// Wait until every enqueued record was processed or evicted.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let c = &self.counters;
            let done = c.processed.load(Ordering::Acquire) + c.evicted.load(Ordering::Acquire);
            if done >= c.enqueued.load(Ordering::Acquire) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop accepting ticks, let workers drain their queues, join them.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Pipeline worker panicked");
            }
        }
        let stats = self.stats();
        info!(processed = stats.processed, evicted = stats.evicted, rejected = stats.rejected, "Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    index: usize,
    rx: Receiver<Queued>,
    handler: Arc<dyn TickHandler>,
    counters: Arc<Counters>,
    latency: Arc<Mutex<Option<Histogram<u64>>>>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.index, "Worker started");
        loop {
            match self.rx.recv_timeout(WORKER_POLL) {
                Ok(queued) => self.process(queued),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    fn process(&self, queued: Queued) {
        let Queued { record, enqueued_at } = queued;
        let waited = enqueued_at.elapsed().as_micros() as u64;
        if let Some(h) = self.latency.lock().as_mut() {
            h.saturating_record(waited);
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(&record)));
        if outcome.is_err() {
            self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
            error!(worker = self.index, seq = record.sequence, instrument = %record.instrument, "Tick handler panicked");
        }
        // back to the pool before the counter moves, so idle means all slots returned
        drop(record);
        self.counters.processed.fetch_add(1, Ordering::Release);
        metrics::counter!("md_records_processed_total").increment(1);
    }
}
