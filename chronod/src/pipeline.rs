//! Ingestion pipeline: N bounded SPSC queues fanning into one writer
//! thread that owns the storage engine.
//!
//! Each session owns a spout. A spout reserves slots from a fixed pool
//! governed by two monotonic counters: `created` (producer side) and
//! `deleted` (bumped by the writer once a slot has been consumed). A
//! slot travels through the queue as a `(pool, index, generation)`
//! reference; the writer validates the generation before reading. The
//! queue itself never blocks the writer.
//!
//! Shutdown: one poison message per queue. The writer counts poisons,
//! drains what it can, closes the storage and exits.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{error, info, warn};

use crate::config::BackoffPolicy;
use crate::error::{Result, StorageError};
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::Sample;

/// Slots per spout.
pub const POOL_SIZE: usize = 0x200;
/// Capacity of each SPSC queue.
pub const QUEUE_CAPACITY: usize = 0x10;
/// Consecutive empty polls before the writer naps.
const IDLE_THRESHOLD: u64 = 0x10000;
/// How long `stop` waits for the writer to drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Callback from the writer to the owning session: `(error, sequence)`.
pub type ErrorCallback = Arc<dyn Fn(StorageError, u64) + Send + Sync>;

struct SlotPool {
    slots: Box<[UnsafeCell<Sample>]>,
    generations: Box<[AtomicU32]>,
}

// The created/deleted protocol gives each slot exactly one owner at any
// time: the producer between reserve and publish, the writer between
// pop and release.
unsafe impl Sync for SlotPool {}

impl SlotPool {
    fn new() -> Self {
        Self {
            slots: (0..POOL_SIZE)
                .map(|_| UnsafeCell::new(Sample::new(0, 0, 0.0)))
                .collect(),
            generations: (0..POOL_SIZE).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

/// State shared between a spout and the writer.
pub struct SpoutShared {
    pool: SlotPool,
    created: AtomicU64,
    deleted: AtomicU64,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl SpoutShared {
    fn new() -> Self {
        Self {
            pool: SlotPool::new(),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            on_error: Mutex::new(None),
        }
    }

    /// Outstanding (unconsumed) slots.
    pub fn gap(&self) -> u64 {
        self.created.load(Ordering::Relaxed) - self.deleted.load(Ordering::Relaxed)
    }
}

/// Slot reference traveling through a queue.
pub struct SlotRef {
    shared: Arc<SpoutShared>,
    index: u32,
    generation: u32,
}

impl SlotRef {
    /// Read the slot if the generation still matches.
    fn take(&self) -> Option<Sample> {
        let stored = self.shared.pool.generations[self.index as usize].load(Ordering::Acquire);
        if stored != self.generation {
            return None;
        }
        Some(unsafe { *self.shared.pool.slots[self.index as usize].get() })
    }

    /// Hand the slot back to the producer; returns the consumed count.
    fn release(&self) -> u64 {
        self.shared.deleted.fetch_add(1, Ordering::Release) + 1
    }

    fn report(&self, error: StorageError, sequence: u64) {
        let guard = self.shared.on_error.lock().unwrap();
        if let Some(cb) = guard.as_ref() {
            cb(error, sequence);
        }
    }
}

pub enum WriterMsg {
    Sample(SlotRef),
    Poison,
}

/// Producer endpoint owned by one session.
pub struct Spout {
    shared: Arc<SpoutShared>,
    queue: Arc<ArrayQueue<WriterMsg>>,
    backoff: BackoffPolicy,
    metrics: Arc<Metrics>,
}

impl Spout {
    pub fn set_error_cb(&self, cb: ErrorCallback) {
        *self.shared.on_error.lock().unwrap() = Some(cb);
    }

    pub fn is_empty(&self) -> bool {
        self.shared.gap() == 0
    }

    /// Enqueue one sample. `LinearBackoff` yields until a slot frees up;
    /// `Throttle` sleeps a millisecond and drops the sample.
    pub async fn write(&self, sample: Sample) -> Result<()> {
        let reserved = loop {
            let created = self.shared.created.load(Ordering::Relaxed);
            let deleted = self.shared.deleted.load(Ordering::Acquire);
            if created - deleted < POOL_SIZE as u64 {
                break created;
            }
            match self.backoff {
                BackoffPolicy::LinearBackoff => tokio::task::yield_now().await,
                BackoffPolicy::Throttle => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    self.metrics.inc_dropped();
                    return Ok(());
                }
            }
        };

        let index = (reserved % POOL_SIZE as u64) as usize;
        let generation = (reserved / POOL_SIZE as u64) as u32;
        unsafe {
            *self.shared.pool.slots[index].get() = sample;
        }
        self.shared.pool.generations[index].store(generation, Ordering::Release);
        self.shared.created.store(reserved + 1, Ordering::Release);

        let mut msg = WriterMsg::Sample(SlotRef {
            shared: self.shared.clone(),
            index: index as u32,
            generation,
        });
        while let Err(back) = self.queue.push(msg) {
            msg = back;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

pub struct IngestionPipeline {
    queues: Vec<Arc<ArrayQueue<WriterMsg>>>,
    spouts: Mutex<Vec<Arc<SpoutShared>>>,
    next_spout: AtomicUsize,
    backoff: BackoffPolicy,
    metrics: Arc<Metrics>,
    writer: Mutex<Option<tokio::task::JoinHandle<Storage>>>,
}

impl IngestionPipeline {
    pub fn new(nqueues: usize, backoff: BackoffPolicy, metrics: Arc<Metrics>) -> Arc<Self> {
        let queues = (0..nqueues.max(1))
            .map(|_| Arc::new(ArrayQueue::new(QUEUE_CAPACITY)))
            .collect();
        Arc::new(Self {
            queues,
            spouts: Mutex::new(Vec::new()),
            next_spout: AtomicUsize::new(0),
            backoff,
            metrics,
            writer: Mutex::new(None),
        })
    }

    /// Launch the writer on a dedicated blocking thread. It owns the
    /// storage until shutdown.
    pub fn start(&self, storage: Storage) {
        let queues = self.queues.clone();
        let metrics = self.metrics.clone();
        info!("starting pipeline writer ({} queues)", queues.len());
        let handle = tokio::task::spawn_blocking(move || writer_loop(queues, storage, metrics));
        *self.writer.lock().unwrap() = Some(handle);
    }

    /// Vend a spout bound to one of the queues, round-robin.
    pub fn make_spout(&self) -> Spout {
        let ix = self.next_spout.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let shared = Arc::new(SpoutShared::new());
        self.spouts.lock().unwrap().push(shared.clone());
        Spout {
            shared,
            queue: self.queues[ix].clone(),
            backoff: self.backoff,
            metrics: self.metrics.clone(),
        }
    }

    /// Poison every queue and wait for the writer to drain and close the
    /// storage. Returns the closed storage when the writer exited in
    /// time.
    pub async fn stop(&self) -> Option<Storage> {
        let handle = self.writer.lock().unwrap().take()?;
        info!("stopping pipeline: pushing poison to queues");
        for queue in &self.queues {
            let mut msg = WriterMsg::Poison;
            while let Err(back) = queue.push(msg) {
                msg = back;
                tokio::task::yield_now().await;
            }
        }
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(storage)) => {
                info!("pipeline stopped");
                Some(storage)
            }
            Ok(Err(e)) => {
                error!("pipeline writer panicked: {e}");
                None
            }
            Err(_) => {
                for spout in self.spouts.lock().unwrap().iter() {
                    let gap = spout.gap();
                    if gap > 0 {
                        warn!("spout still holds {gap} unconsumed slots, skipping");
                    }
                }
                error!("pipeline writer did not stop within {STOP_TIMEOUT:?}");
                None
            }
        }
    }
}

fn writer_loop(
    queues: Vec<Arc<ArrayQueue<WriterMsg>>>,
    mut storage: Storage,
    metrics: Arc<Metrics>,
) -> Storage {
    let nqueues = queues.len() as u64;
    let mut poison_count = 0usize;
    let mut idle_count: u64 = 0;
    let mut ix: u64 = 0;
    loop {
        let queue = &queues[(ix % nqueues) as usize];
        ix = ix.wrapping_add(1);
        match queue.pop() {
            Some(WriterMsg::Poison) => {
                poison_count += 1;
                if poison_count == queues.len() {
                    for queue in &queues {
                        if !queue.is_empty() {
                            error!("queue not empty, some data will be lost");
                        }
                    }
                    info!("closing storage");
                    if let Err(e) = storage.close() {
                        error!("storage close failed: {e}");
                    }
                    info!("pipeline writer stopped");
                    return storage;
                }
            }
            Some(WriterMsg::Sample(slot)) => {
                idle_count = 0;
                match slot.take() {
                    Some(sample) => {
                        let outcome = storage.write(sample);
                        let sequence = slot.release();
                        match outcome {
                            Ok(()) => metrics.inc_written(),
                            Err(StorageError::LateWrite) => {
                                metrics.inc_late_write();
                                slot.report(StorageError::LateWrite, sequence);
                            }
                            Err(e) => {
                                metrics.inc_db_error();
                                slot.report(e, sequence);
                            }
                        }
                    }
                    None => {
                        warn!("stale slot generation, skipping sample");
                        slot.release();
                    }
                }
            }
            None => {
                idle_count += 1;
                if idle_count > IDLE_THRESHOLD && idle_count % nqueues == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Durability, StorageConfig};
    use crate::storage::catalog::Catalog;
    use crate::storage::{catalog_path, Storage};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tempfile::tempdir;

    async fn storage_fixture(dir: &std::path::Path) -> (Storage, Catalog) {
        let config = StorageConfig {
            path: dir.to_path_buf(),
            nvolumes: 2,
            volume_capacity: 256,
            window_size: 1000,
            compression_threshold: 1,
            max_cache_size: u64::MAX,
            durability: Durability::Balanced,
            enable_huge_tlb: false,
        };
        Storage::create(&config).await.unwrap();
        let catalog = Catalog::open(catalog_path(&config.path)).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let storage = Storage::open(&config, metrics, &catalog).await.unwrap();
        (storage, catalog)
    }

    #[tokio::test]
    async fn samples_flow_to_storage_and_poison_stops() {
        let dir = tempdir().unwrap();
        let (storage, catalog) = storage_fixture(dir.path()).await;
        let registry = storage.registry();
        let id = registry.resolve("cpu host=a").unwrap();

        let metrics = Arc::new(Metrics::new());
        let pipeline =
            IngestionPipeline::new(4, BackoffPolicy::LinearBackoff, metrics.clone());
        pipeline.start(storage);

        let spout = pipeline.make_spout();
        // More samples than the slot pool holds, to exercise reuse.
        let total = POOL_SIZE * 3;
        for i in 0..total {
            spout.write(Sample::new(id, 10 + i as u64, 1.0)).await.unwrap();
        }

        let mut storage = pipeline.stop().await.expect("writer returns storage");
        assert_eq!(
            metrics.samples_written.load(AtomicOrdering::Relaxed),
            total as u64
        );
        assert!(spout.is_empty());
        // Everything the writer accepted is on disk or was merged at close.
        let page = storage.page_mut(0);
        let mut persisted = 0usize;
        let descs = page.header.index.clone();
        for desc in &descs {
            let payload = page.read_chunk(desc).unwrap();
            persisted += crate::storage::compression::decode_chunk(&payload)
                .unwrap()
                .len();
        }
        assert_eq!(persisted, total);
        catalog.close().await;
    }

    #[tokio::test]
    async fn late_writes_reach_the_error_callback() {
        let dir = tempdir().unwrap();
        let (storage, catalog) = storage_fixture(dir.path()).await;
        let id = storage.registry().resolve("cpu host=a").unwrap();

        let metrics = Arc::new(Metrics::new());
        let pipeline =
            IngestionPipeline::new(1, BackoffPolicy::LinearBackoff, metrics.clone());
        pipeline.start(storage);

        let spout = pipeline.make_spout();
        let failures = Arc::new(AtomicU64::new(0));
        let seen = failures.clone();
        spout.set_error_cb(Arc::new(move |error, _seq| {
            assert_eq!(error, StorageError::LateWrite);
            seen.fetch_add(1, AtomicOrdering::Relaxed);
        }));

        spout.write(Sample::new(id, 50_000, 1.0)).await.unwrap();
        spout.write(Sample::new(id, 10, 1.0)).await.unwrap(); // far too old
        pipeline.stop().await.unwrap();

        assert_eq!(failures.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(metrics.late_writes.load(AtomicOrdering::Relaxed), 1);
        catalog.close().await;
    }

    #[tokio::test]
    async fn spout_counters_track_slot_lifecycle() {
        let metrics = Arc::new(Metrics::new());
        let pipeline =
            IngestionPipeline::new(1, BackoffPolicy::LinearBackoff, metrics.clone());
        let spout = pipeline.make_spout();

        // No writer running: slots accumulate in the pool and queue.
        for i in 0..4u64 {
            spout.write(Sample::new(1, i, 0.0)).await.unwrap();
        }
        assert_eq!(spout.shared.gap(), 4);
        assert!(!spout.is_empty());

        // Drain by hand, as the writer would.
        let queue = pipeline.queues[0].clone();
        while let Some(WriterMsg::Sample(slot)) = queue.pop() {
            assert!(slot.take().is_some());
            slot.release();
        }
        assert!(spout.is_empty());
    }

    #[test]
    fn generation_mismatch_is_detected() {
        let shared = Arc::new(SpoutShared::new());
        shared.pool.generations[3].store(7, Ordering::Release);
        let slot = SlotRef {
            shared: shared.clone(),
            index: 3,
            generation: 6,
        };
        assert!(slot.take().is_none());
        let slot = SlotRef {
            shared,
            index: 3,
            generation: 7,
        };
        assert!(slot.take().is_some());
    }
}
