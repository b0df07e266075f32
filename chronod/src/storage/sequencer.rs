//! Reorder buffer: accepts approximately-sorted samples and emits
//! strictly `(timestamp, series_id)`-sorted compressed chunks.
//!
//! Samples are kept in patience-sort runs. Each run is sorted; the runs
//! are kept ordered by descending tail key so insertion is a binary
//! search over the tail cache. When the top timestamp crosses a window
//! boundary the runs are partitioned: everything older than the previous
//! window moves to the ready set and is merged into one chunk, unless the
//! ready set is still below the compression threshold.
//!
//! The sequence counter is odd while a merge is pending and even when
//! the buffer is stable; a checkpoint that finds the counter odd fails
//! with `Busy`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::warn;

use crate::error::{Result, StorageError};
use crate::storage::compression::encode_chunk;
use crate::storage::page::{BoundingBox, ChunkDesc, Page};
use crate::types::{Sample, SeriesId, Timestamp};

/// Rough in-memory footprint of one buffered sample.
const SPACE_PER_ELEMENT: usize = 24;

type SortedRun = Vec<Sample>;
type Key = (Timestamp, SeriesId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Sample buffered; nothing else to do.
    Stored,
    /// A window closed: the ready set awaits `merge_and_compress`.
    MergeReady,
}

pub struct Sequencer {
    window_size: u64,
    c_threshold: usize,
    max_cache_size: u64,
    top_timestamp: Timestamp,
    checkpoint: u64,
    /// Odd while a merge is in progress.
    sequence: u64,
    runs: Vec<SortedRun>,
    /// `tails[i]` mirrors `runs[i].last().key()`.
    tails: Vec<Key>,
    ready: Vec<SortedRun>,
    space_estimate: usize,
}

impl Sequencer {
    pub fn new(window_size: u64, c_threshold: usize, max_cache_size: u64) -> Self {
        assert!(window_size >= 2, "window size must be at least 2");
        Self {
            window_size,
            c_threshold,
            max_cache_size,
            top_timestamp: 0,
            checkpoint: 0,
            sequence: 0,
            runs: Vec::new(),
            tails: Vec::new(),
            ready: Vec::new(),
            space_estimate: 0,
        }
    }

    pub fn top_timestamp(&self) -> Timestamp {
        self.top_timestamp
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// True while a checkpoint awaits its merge.
    pub fn merge_pending(&self) -> bool {
        self.sequence % 2 == 1
    }

    pub fn space_estimate(&self) -> usize {
        self.space_estimate
    }

    fn window_id(&self, ts: Timestamp) -> u64 {
        ts / self.window_size
    }

    /// Accept one sample. Fails with `LateWrite` when the sample is older
    /// than the window and `Busy` when a window boundary is crossed while
    /// the previous merge is still pending.
    pub fn add(&mut self, sample: Sample) -> Result<AddOutcome> {
        let ts = sample.timestamp;
        if ts < self.top_timestamp && self.top_timestamp - ts > self.window_size {
            return Err(StorageError::LateWrite);
        }

        let mut outcome = AddOutcome::Stored;
        let point = self.window_id(ts);
        if point > self.checkpoint {
            if self.merge_pending() {
                return Err(StorageError::Busy);
            }
            if self.make_checkpoint(point) {
                outcome = AddOutcome::MergeReady;
            }
        }

        self.insert(sample);
        self.top_timestamp = self.top_timestamp.max(ts);
        if self.space_estimate as u64 > self.max_cache_size {
            warn!(
                "sequencer cache estimate {} exceeds soft cap {}",
                self.space_estimate, self.max_cache_size
            );
        }
        Ok(outcome)
    }

    /// Patience insertion: the leftmost run whose tail is <= the sample
    /// takes it; an equal tail key is overwritten (later write wins);
    /// otherwise a new run starts.
    fn insert(&mut self, sample: Sample) {
        let key = sample.key();
        let ix = self.tails.partition_point(|tail| *tail > key);
        if ix == self.runs.len() {
            self.runs.push(vec![sample]);
            self.tails.push(key);
            self.space_estimate += SPACE_PER_ELEMENT;
            return;
        }
        debug_assert!(self.tails[ix] <= key);
        if self.tails[ix] == key {
            let last = self.runs[ix]
                .last_mut()
                .expect("runs in the tail cache are non-empty");
            *last = sample;
        } else {
            self.runs[ix].push(sample);
            self.tails[ix] = key;
            self.space_estimate += SPACE_PER_ELEMENT;
        }
    }

    /// Partition every run at the window boundary. Returns true when the
    /// ready set was committed (merge now pending), false when the
    /// checkpoint was absorbed because the aged data is still below the
    /// compression threshold.
    fn make_checkpoint(&mut self, new_checkpoint: u64) -> bool {
        self.sequence += 1; // odd: merge in progress
        let boundary = new_checkpoint.saturating_sub(1) * self.window_size;
        self.checkpoint = new_checkpoint;

        let mut residual: Vec<SortedRun> = Vec::with_capacity(self.runs.len());
        for mut run in self.runs.drain(..) {
            let split = run.partition_point(|s| s.timestamp < boundary);
            if split == 0 {
                residual.push(run);
            } else if split == run.len() {
                self.ready.push(run);
            } else {
                let newer = run.split_off(split);
                self.ready.push(run);
                residual.push(newer);
            }
        }
        self.runs = residual;

        let ready_size: usize = self.ready.iter().map(Vec::len).sum();
        if ready_size < self.c_threshold {
            // Not enough aged data for efficient compression; keep
            // accumulating and make the aged runs insertable again.
            self.sequence += 1; // even again
            let ready = std::mem::take(&mut self.ready);
            self.runs.extend(ready);
            self.runs.sort_by_key(|run| {
                Reverse(run.last().expect("ready runs are non-empty").key())
            });
            self.rebuild_tails();
            return false;
        }

        self.rebuild_tails();
        true
    }

    fn rebuild_tails(&mut self) {
        self.runs.retain(|run| !run.is_empty());
        self.tails = self
            .runs
            .iter()
            .map(|run| run.last().expect("empty runs were dropped").key())
            .collect();
        self.space_estimate =
            self.runs.iter().map(Vec::len).sum::<usize>() * SPACE_PER_ELEMENT;
    }

    /// Merge the ready runs, encode them as one chunk and append it to
    /// the target page. On `Overflow` the ready set is left intact so the
    /// caller can rotate volumes and retry.
    pub fn merge_and_compress(&mut self, target: &mut Page) -> Result<()> {
        if !self.merge_pending() {
            return Err(StorageError::Busy);
        }
        if self.ready.is_empty() {
            self.sequence += 1;
            return Ok(());
        }

        let merged = merge_runs(&self.ready);
        debug_assert!(!merged.is_empty());
        let payload = encode_chunk(&merged)?;
        let offset = target.add_chunk(&payload, 0)?;

        let mut bbox = BoundingBox::default();
        for sample in &merged {
            bbox.update(sample.series_id, sample.timestamp);
        }
        target.header.checkpoint = self.checkpoint as u32;
        target.complete_chunk(
            ChunkDesc {
                timestamp: merged[0].timestamp,
                block_offset: offset,
                length: payload.len() as u32,
            },
            bbox,
        )?;

        self.ready.clear();
        self.sequence += 1; // even: stable
        Ok(())
    }

    /// Force every buffered sample into the ready set and flush it.
    pub fn close(&mut self, target: &mut Page) -> Result<()> {
        self.stage_all();
        self.merge_and_compress(target)
    }

    /// Force everything into the ready set without flushing. The caller
    /// decides where (and whether) the pending merge lands.
    pub fn reset(&mut self) {
        self.stage_all();
    }

    fn stage_all(&mut self) {
        let runs = std::mem::take(&mut self.runs);
        self.ready.extend(runs.into_iter().filter(|r| !r.is_empty()));
        self.tails.clear();
        self.space_estimate = 0;
        if !self.merge_pending() {
            self.sequence += 1;
        }
    }
}

/// K-way merge over sorted runs. Equal `(timestamp, series_id)` keys
/// collapse to the sample from the later-created (higher-index) run.
fn merge_runs(runs: &[SortedRun]) -> Vec<Sample> {
    let total: usize = runs.iter().map(Vec::len).sum();
    let mut heap: BinaryHeap<Reverse<(Key, usize, usize)>> = BinaryHeap::new();
    for (ix, run) in runs.iter().enumerate() {
        if let Some(first) = run.first() {
            heap.push(Reverse((first.key(), ix, 0)));
        }
    }

    let mut out: Vec<Sample> = Vec::with_capacity(total);
    while let Some(Reverse((key, ix, pos))) = heap.pop() {
        let sample = runs[ix][pos];
        match out.last_mut() {
            Some(last) if last.key() == key => *last = sample,
            _ => out.push(sample),
        }
        if pos + 1 < runs[ix].len() {
            heap.push(Reverse((runs[ix][pos + 1].key(), ix, pos + 1)));
        }
    }
    out
}
