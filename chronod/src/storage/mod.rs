//! Storage engine: a ring of paged volumes fed by the sequencer.
//!
//! The façade is owned by the single pipeline writer thread. Sessions
//! share only the registry (behind an `Arc`); shutdown flows from the
//! pipeline into [`Storage::close`].

pub mod catalog;
pub mod compression;
pub mod page;
pub mod sequencer;
pub mod series;
pub mod volume;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};

use crate::config::{Durability, StorageConfig};
use crate::error::{Result, StorageError};
use crate::metrics::Metrics;
use crate::types::Sample;

use catalog::Catalog;
use page::{Page, PageHeader};
use sequencer::{AddOutcome, Sequencer};
use series::{SeriesRegistry, SeriesSession};
use volume::{MetaVolume, Volume, VolumeDesc};

const VOLUME_VERSION: u32 = 2;

fn volume_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("volume.{id}"))
}

fn meta_path(dir: &Path) -> PathBuf {
    dir.join("meta")
}

pub fn catalog_path(dir: &Path) -> PathBuf {
    dir.join("catalog.sqlite")
}

/// Shared handle vended to sessions: the registry plus the metrics block.
#[derive(Clone)]
pub struct DbHandle {
    registry: Arc<SeriesRegistry>,
    metrics: Arc<Metrics>,
}

impl DbHandle {
    pub fn open_session(&self) -> SeriesSession {
        SeriesSession::new(self.registry.clone())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<SeriesRegistry> {
        &self.registry
    }
}

pub struct Storage {
    pages: Vec<Page>,
    active: usize,
    sequencer: Sequencer,
    registry: Arc<SeriesRegistry>,
    meta: Arc<MetaVolume>,
    metrics: Arc<Metrics>,
    durability: Durability,
    flush_counter: u32,
    closed: bool,
}

impl Storage {
    /// Initialize a fresh database directory: volume files, meta-volume
    /// and catalog. Volume 0 starts as the active one.
    pub async fn create(config: &StorageConfig) -> anyhow::Result<()> {
        std::fs::create_dir_all(&config.path)
            .with_context(|| format!("creating {}", config.path.display()))?;
        let catalog = Catalog::open(catalog_path(&config.path))
            .await
            .context("opening catalog")?;
        if !catalog.load_volumes().await?.is_empty() {
            anyhow::bail!("database already initialized at {}", config.path.display());
        }

        let mut descs = Vec::new();
        for id in 0..config.nvolumes {
            let path = volume_path(&config.path, id);
            Volume::create_new(&path, config.volume_capacity)
                .with_context(|| format!("creating {}", path.display()))?;
            let volume = Volume::open_existing(id, &path, false)?;
            let mut header = PageHeader::new(id, config.volume_capacity);
            if id == 0 {
                header.reuse(); // the initial active volume
            }
            let mut page = Page::new(header, volume);
            page.format()?;
            page.volume.flush();

            let desc = VolumeDesc {
                version: VOLUME_VERSION,
                id,
                nblocks: page.volume.write_pos(),
                capacity: config.volume_capacity,
                generation: 0,
                path: path.display().to_string(),
            };
            catalog.add_volume(&desc).await.context("adding volume")?;
            descs.push(desc);
        }
        MetaVolume::create_new(&meta_path(&config.path), descs)?;
        catalog.close().await;
        info!(
            "created database at {} ({} volumes x {} blocks)",
            config.path.display(),
            config.nvolumes,
            config.volume_capacity
        );
        Ok(())
    }

    /// Open an existing database, electing the active volume and
    /// restoring the registry from the catalog.
    pub async fn open(
        config: &StorageConfig,
        metrics: Arc<Metrics>,
        catalog: &Catalog,
    ) -> anyhow::Result<Self> {
        let volumes = catalog.load_volumes().await.context("loading volumes")?;
        if volumes.is_empty() {
            anyhow::bail!(
                "no volumes registered; run `chronod create` for {}",
                config.path.display()
            );
        }
        let meta = Arc::new(MetaVolume::open_existing(&meta_path(&config.path))?);

        let mut pages = Vec::with_capacity(volumes.len());
        for desc in &volumes {
            let mut volume =
                Volume::open_existing(desc.id, Path::new(&desc.path), config.enable_huge_tlb)
                    .with_context(|| format!("opening {}", desc.path))?;
            let block = volume.read_block_raw(0)?;
            let header = PageHeader::from_block(&block)?;
            volume.set_write_pos(header.last_offset);
            pages.push(Page::new(header, volume));
        }

        // The volume with the highest open count is the active one; ties
        // go to the highest index.
        let mut active = 0;
        let mut max_opens = -1i64;
        for (ix, p) in pages.iter().enumerate() {
            if i64::from(p.header.open_count) >= max_opens {
                max_opens = i64::from(p.header.open_count);
                active = ix;
            }
        }

        let registry = Arc::new(SeriesRegistry::new());
        let names = catalog
            .load_series_names()
            .await
            .context("loading series names")?;
        info!("restored {} series names", names.len());
        registry.restore(names);

        let mut storage = Self {
            pages,
            active,
            sequencer: Sequencer::new(
                config.window_size,
                config.compression_threshold,
                config.max_cache_size,
            ),
            registry,
            meta,
            metrics,
            durability: config.durability,
            flush_counter: 0,
            closed: false,
        };

        let header = &storage.pages[storage.active].header;
        info!(
            "active volume: page {} (open={} close={})",
            header.page_id, header.open_count, header.close_count
        );
        if header.open_count == header.close_count {
            // A rotation was interrupted between closing the old volume
            // and opening the next one. Finish it.
            warn!("interrupted rotation detected, advancing to next volume");
            storage.switch_to_next()?;
        }
        Ok(storage)
    }

    pub fn handle(&self) -> DbHandle {
        DbHandle {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn registry(&self) -> Arc<SeriesRegistry> {
        self.registry.clone()
    }

    pub fn meta(&self) -> Arc<MetaVolume> {
        self.meta.clone()
    }

    pub fn active_volume_id(&self) -> u32 {
        self.pages[self.active].header.page_id
    }

    /// Accept one sample from the pipeline writer.
    pub fn write(&mut self, sample: Sample) -> Result<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        match self.sequencer.add(sample) {
            Ok(AddOutcome::Stored) => Ok(()),
            Ok(AddOutcome::MergeReady) => self.run_merge(),
            Err(StorageError::Busy) => {
                // A previous merge is still outstanding: run it, then
                // retry the sample exactly once.
                self.run_merge()?;
                match self.sequencer.add(sample) {
                    Ok(AddOutcome::Stored) => Ok(()),
                    Ok(AddOutcome::MergeReady) => self.run_merge(),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn run_merge(&mut self) -> Result<()> {
        if !self.sequencer.merge_pending() {
            return Ok(());
        }
        let before = self.pages[self.active].header.count;
        match self.sequencer.merge_and_compress(&mut self.pages[self.active]) {
            Ok(()) => {
                if self.pages[self.active].header.count > before {
                    self.metrics.inc_chunk();
                }
                self.flush_policy();
                Ok(())
            }
            Err(StorageError::Overflow) => {
                self.advance_volume()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// fsync cadence selected by the durability mode.
    fn flush_policy(&mut self) {
        self.flush_counter += 1;
        if self.flush_counter % self.durability.sync_interval() == 0 {
            let page = &mut self.pages[self.active];
            page.header.sync_count = page.header.count;
            if let Err(e) = page.sync_header() {
                error!("header sync failed: {e}");
            }
            page.volume.flush();
        }
    }

    /// Rotate to the next volume in the ring: complete any pending merge
    /// onto the current page, close it, then destructively reopen the
    /// oldest volume. A merge that still does not fit after rotation is
    /// fatal.
    fn advance_volume(&mut self) -> Result<()> {
        {
            let page = &mut self.pages[self.active];
            info!(
                "advancing volume: page {} open={} close={}",
                page.header.page_id, page.header.open_count, page.header.close_count
            );
        }

        // Step 1: drain the sequencer onto the current page if possible.
        self.sequencer.reset();
        if self.sequencer.merge_pending() {
            let before = self.pages[self.active].header.count;
            match self.sequencer.merge_and_compress(&mut self.pages[self.active]) {
                Ok(()) => {
                    if self.pages[self.active].header.count > before {
                        self.metrics.inc_chunk();
                    }
                }
                Err(StorageError::Overflow) => {
                    // The ready set rides along to the next volume.
                    warn!("pending merge does not fit the closing volume");
                }
                Err(e) => return Err(e),
            }
        }

        // Step 2: close the current volume.
        {
            let page = &mut self.pages[self.active];
            page.header.close();
            page.sync_header()?;
            page.volume.flush();
            self.meta
                .set_nblocks(page.header.page_id, page.volume.write_pos())?;
        }

        // Step 3: destructively reopen the next volume in the ring.
        self.switch_to_next()?;

        // Carried-over merge lands on the fresh page; failing again is a
        // full-ring condition we cannot recover from.
        if self.sequencer.merge_pending() {
            let before = self.pages[self.active].header.count;
            match self.sequencer.merge_and_compress(&mut self.pages[self.active]) {
                Ok(()) => {
                    if self.pages[self.active].header.count > before {
                        self.metrics.inc_chunk();
                    }
                }
                Err(e) => {
                    error!("merge failed after volume rotation: {e}");
                    panic!("merge failed after volume rotation: {e}");
                }
            }
            self.flush_policy();
        }
        Ok(())
    }

    /// Rotation step 3 alone; also the crash-recovery continuation.
    fn switch_to_next(&mut self) -> Result<()> {
        self.active = (self.active + 1) % self.pages.len();
        let page = &mut self.pages[self.active];
        page.header.reuse();
        page.format()?;
        page.volume.flush();
        let id = page.header.page_id;
        self.meta.bump_generation(id)?;
        self.meta.set_nblocks(id, page.volume.write_pos())?;
        self.metrics.inc_rotation();
        info!(
            "volume opened: page {} open={} close={}",
            page.header.page_id, page.header.open_count, page.header.close_count
        );
        Ok(())
    }

    /// Merge whatever is buffered, flush the active volume and stop
    /// accepting writes. Registry persistence is driven by the flusher
    /// task that owns the catalog.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.sequencer.close(&mut self.pages[self.active]) {
            Ok(()) => {}
            Err(StorageError::Overflow) => {
                self.advance_volume()?;
            }
            Err(e) => return Err(e),
        }
        let page = &mut self.pages[self.active];
        page.header.sync_count = page.header.count;
        page.sync_header()?;
        page.volume.flush();
        self.meta
            .set_nblocks(page.header.page_id, page.volume.write_pos())?;
        self.meta.flush();
        info!("storage closed");
        Ok(())
    }

    /// Test and tooling access to a page in the ring.
    pub fn page_mut(&mut self, ix: usize) -> &mut Page {
        &mut self.pages[ix]
    }

    pub fn nvolumes(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compression::decode_chunk;
    use tempfile::tempdir;

    fn small_config(dir: &Path, capacity: u32) -> StorageConfig {
        StorageConfig {
            path: dir.to_path_buf(),
            nvolumes: 3,
            volume_capacity: capacity,
            window_size: 1000,
            compression_threshold: 1,
            max_cache_size: u64::MAX,
            durability: Durability::Max,
            enable_huge_tlb: false,
        }
    }

    async fn open_storage(config: &StorageConfig) -> (Storage, Catalog) {
        let catalog = Catalog::open(catalog_path(&config.path)).await.unwrap();
        let storage = Storage::open(config, Arc::new(Metrics::new()), &catalog)
            .await
            .unwrap();
        (storage, catalog)
    }

    fn ring_invariant(storage: &Storage) {
        for (ix, page) in storage.pages.iter().enumerate() {
            if ix == storage.active {
                assert_eq!(page.header.open_count, page.header.close_count + 1);
            } else {
                assert_eq!(page.header.open_count, page.header.close_count);
            }
        }
    }

    #[tokio::test]
    async fn create_then_open_elects_volume_zero() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path(), 64);
        Storage::create(&config).await.unwrap();
        let (storage, catalog) = open_storage(&config).await;
        assert_eq!(storage.active_volume_id(), 0);
        ring_invariant(&storage);
        catalog.close().await;
    }

    #[tokio::test]
    async fn write_resolve_and_read_back() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path(), 64);
        Storage::create(&config).await.unwrap();
        let (mut storage, catalog) = open_storage(&config).await;

        let id = storage.registry().resolve("cpu host=a").unwrap();
        assert_eq!(id, 1024);
        for ts in [100u64, 50, 80] {
            storage.write(Sample::new(id, ts, ts as f64)).unwrap();
        }
        // Crossing two windows triggers the merge of the buffered three.
        storage.write(Sample::new(id, 2000, 0.5)).unwrap();
        storage.close().unwrap();

        let page = storage.page_mut(0);
        let descs = page.header.index.clone();
        let mut all = Vec::new();
        for desc in &descs {
            let payload = page.read_chunk(desc).unwrap();
            all.extend(decode_chunk(&payload).unwrap());
        }
        let timestamps: Vec<_> = all.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![50, 80, 100, 2000]);
        catalog.close().await;
    }

    #[tokio::test]
    async fn writes_after_close_are_rejected() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path(), 64);
        Storage::create(&config).await.unwrap();
        let (mut storage, catalog) = open_storage(&config).await;
        storage.close().unwrap();
        assert_eq!(
            storage.write(Sample::new(1024, 1, 1.0)),
            Err(StorageError::Closed)
        );
        catalog.close().await;
    }

    #[tokio::test]
    async fn full_volume_rotates_and_keeps_invariant() {
        let dir = tempdir().unwrap();
        // Tiny volumes: header + 2 data blocks each.
        let config = small_config(dir.path(), 3);
        Storage::create(&config).await.unwrap();
        let (mut storage, catalog) = open_storage(&config).await;

        let mut ts = 0u64;
        for _ in 0..40 {
            // Each window holds a few hundred samples; chunks of ~500
            // samples overflow a 2-block volume quickly.
            for i in 0..400u64 {
                ts += 1;
                let _ = storage.write(Sample::new(1024 + i % 3, ts, 0.25));
            }
        }
        assert!(storage.metrics.volume_rotations.load(std::sync::atomic::Ordering::Relaxed) > 0);
        ring_invariant(&storage);
        storage.close().unwrap();
        catalog.close().await;
    }

    #[tokio::test]
    async fn restart_elects_highest_open_count() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path(), 64);
        Storage::create(&config).await.unwrap();
        {
            let (mut storage, catalog) = open_storage(&config).await;
            // Force one rotation so volume 1 becomes active.
            storage.advance_volume().unwrap();
            ring_invariant(&storage);
            assert_eq!(storage.active_volume_id(), 1);
            storage.close().unwrap();
            catalog.close().await;
        }
        let (storage, catalog) = open_storage(&config).await;
        assert_eq!(storage.active_volume_id(), 1);
        ring_invariant(&storage);
        catalog.close().await;
    }

    #[tokio::test]
    async fn interrupted_rotation_recovers_to_single_active() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path(), 64);
        Storage::create(&config).await.unwrap();
        {
            let (mut storage, catalog) = open_storage(&config).await;
            // Simulate a crash between closing the active volume and
            // opening the next: close_count catches up with open_count.
            let page = storage.page_mut(0);
            page.header.close();
            page.sync_header().unwrap();
            page.volume.flush();
            catalog.close().await;
        }
        let (storage, catalog) = open_storage(&config).await;
        // Recovery advanced to volume 1 and reopened it.
        assert_eq!(storage.active_volume_id(), 1);
        ring_invariant(&storage);
        catalog.close().await;
    }
}
