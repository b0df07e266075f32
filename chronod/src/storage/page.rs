//! Page layout on top of the block store.
//!
//! Block 0 of a volume holds the page header: fixed fields followed by
//! the chunk index, which grows through the remainder of the header
//! block. Data blocks are appended from block 1 upward. Every data block
//! carries an 8-byte header `{kind: u16, flags: u16, len: u32}`; a chunk
//! larger than one block continues into following blocks flagged with
//! `FLAG_CONTINUATION`, so no block ever straddles two chunks without
//! the flag saying so.

use crate::error::{Result, StorageError};
use crate::storage::volume::Volume;
use crate::types::{SeriesId, Timestamp, BLOCK_SIZE};

pub const PAGE_VERSION: u32 = 2;

/// Bytes of fixed header fields before the chunk index.
const HEADER_FIXED: usize = 72;
const INDEX_ENTRY_SIZE: usize = 16;
/// Chunk descriptors that fit in the header block.
pub const INDEX_CAPACITY: usize = (BLOCK_SIZE - HEADER_FIXED) / INDEX_ENTRY_SIZE;

const BLOCK_HDR_SIZE: usize = 8;
/// Payload bytes per data block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_HDR_SIZE;

const KIND_CHUNK: u16 = 1;
const KIND_ENTRY: u16 = 2;
const FLAG_CONTINUATION: u16 = 0x1;

/// Uncompressed entry header: timestamp + series id + payload length.
const ENTRY_HDR_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_id: SeriesId,
    pub max_id: SeriesId,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min_id: SeriesId::MAX,
            max_id: 0,
            min_ts: Timestamp::MAX,
            max_ts: 0,
        }
    }
}

impl BoundingBox {
    pub fn update(&mut self, id: SeriesId, ts: Timestamp) {
        self.min_id = self.min_id.min(id);
        self.max_id = self.max_id.max(id);
        self.min_ts = self.min_ts.min(ts);
        self.max_ts = self.max_ts.max(ts);
    }

    pub fn is_empty(&self) -> bool {
        self.min_ts > self.max_ts
    }
}

/// Index record for one chunk (or raw entry) on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDesc {
    /// Smallest timestamp inside the chunk.
    pub timestamp: Timestamp,
    /// First data block of the chunk.
    pub block_offset: u32,
    /// Total payload bytes.
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    pub version: u32,
    pub page_id: u32,
    /// Number of index records.
    pub count: u32,
    /// Next block to append; mirrors the volume write position.
    pub last_offset: u32,
    /// Index of the last record covered by an fsync.
    pub sync_count: u32,
    /// Sequencer checkpoint at the last header sync.
    pub checkpoint: u32,
    /// Times this page was opened for write.
    pub open_count: u32,
    /// Times this page was closed for write.
    pub close_count: u32,
    /// Page size in bytes.
    pub length: u64,
    pub bbox: BoundingBox,
    pub index: Vec<ChunkDesc>,
}

impl PageHeader {
    pub fn new(page_id: u32, capacity_blocks: u32) -> Self {
        Self {
            version: PAGE_VERSION,
            page_id,
            count: 0,
            last_offset: 1,
            sync_count: 0,
            checkpoint: 0,
            open_count: 0,
            close_count: 0,
            length: capacity_blocks as u64 * BLOCK_SIZE as u64,
            bbox: BoundingBox::default(),
            index: Vec::new(),
        }
    }

    /// Clear page content for rewrite; bumps `open_count`.
    pub fn reuse(&mut self) {
        self.count = 0;
        self.last_offset = 1;
        self.sync_count = 0;
        self.checkpoint = 0;
        self.open_count += 1;
        self.bbox = BoundingBox::default();
        self.index.clear();
    }

    /// Close page for write; bumps `close_count`.
    pub fn close(&mut self) {
        self.close_count += 1;
    }

    pub fn index_full(&self) -> bool {
        self.index.len() >= INDEX_CAPACITY
    }

    pub fn to_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&self.version.to_le_bytes());
        block[4..8].copy_from_slice(&self.page_id.to_le_bytes());
        block[8..12].copy_from_slice(&self.count.to_le_bytes());
        block[12..16].copy_from_slice(&self.last_offset.to_le_bytes());
        block[16..20].copy_from_slice(&self.sync_count.to_le_bytes());
        block[20..24].copy_from_slice(&self.checkpoint.to_le_bytes());
        block[24..28].copy_from_slice(&self.open_count.to_le_bytes());
        block[28..32].copy_from_slice(&self.close_count.to_le_bytes());
        block[32..40].copy_from_slice(&self.length.to_le_bytes());
        block[40..48].copy_from_slice(&self.bbox.min_id.to_le_bytes());
        block[48..56].copy_from_slice(&self.bbox.max_id.to_le_bytes());
        block[56..64].copy_from_slice(&self.bbox.min_ts.to_le_bytes());
        block[64..72].copy_from_slice(&self.bbox.max_ts.to_le_bytes());
        for (i, desc) in self.index.iter().enumerate() {
            let at = HEADER_FIXED + i * INDEX_ENTRY_SIZE;
            block[at..at + 8].copy_from_slice(&desc.timestamp.to_le_bytes());
            block[at + 8..at + 12].copy_from_slice(&desc.block_offset.to_le_bytes());
            block[at + 12..at + 16].copy_from_slice(&desc.length.to_le_bytes());
        }
        block
    }

    pub fn from_block(block: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let u32_at =
            |at: usize| u32::from_le_bytes(block[at..at + 4].try_into().unwrap());
        let u64_at =
            |at: usize| u64::from_le_bytes(block[at..at + 8].try_into().unwrap());
        let version = u32_at(0);
        if version != PAGE_VERSION {
            return Err(StorageError::bad_data(format!(
                "unsupported page version {version}"
            )));
        }
        let count = u32_at(8);
        if count as usize > INDEX_CAPACITY {
            return Err(StorageError::bad_data("page index count out of range"));
        }
        let mut index = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = HEADER_FIXED + i * INDEX_ENTRY_SIZE;
            index.push(ChunkDesc {
                timestamp: u64_at(at),
                block_offset: u32::from_le_bytes(block[at + 8..at + 12].try_into().unwrap()),
                length: u32::from_le_bytes(block[at + 12..at + 16].try_into().unwrap()),
            });
        }
        Ok(Self {
            version,
            page_id: u32_at(4),
            count,
            last_offset: u32_at(12),
            sync_count: u32_at(16),
            checkpoint: u32_at(20),
            open_count: u32_at(24),
            close_count: u32_at(28),
            length: u64_at(32),
            bbox: BoundingBox {
                min_id: u64_at(40),
                max_id: u64_at(48),
                min_ts: u64_at(56),
                max_ts: u64_at(64),
            },
            index,
        })
    }
}

/// One volume with its page header: the unit the storage façade rotates.
pub struct Page {
    pub header: PageHeader,
    pub volume: Volume,
}

impl Page {
    pub fn new(header: PageHeader, volume: Volume) -> Self {
        Self { header, volume }
    }

    /// Format the underlying volume for this header: rewinds the write
    /// position and lays the header down as block 0.
    pub fn format(&mut self) -> Result<()> {
        self.volume.reset();
        let block = self.header.to_block();
        self.volume.append_block(&block)?;
        self.header.last_offset = self.volume.write_pos();
        Ok(())
    }

    /// Rewrite the header block in place.
    pub fn sync_header(&mut self) -> Result<()> {
        self.header.last_offset = self.volume.write_pos();
        let block = self.header.to_block();
        self.volume.overwrite_block(0, &block)
    }

    fn free_blocks(&self) -> u32 {
        self.volume.capacity() - self.volume.write_pos()
    }

    fn append_data_block(
        &mut self,
        kind: u16,
        flags: u16,
        payload: &[u8],
    ) -> Result<u32> {
        debug_assert!(payload.len() <= BLOCK_PAYLOAD);
        let mut block = [0u8; BLOCK_SIZE];
        block[0..2].copy_from_slice(&kind.to_le_bytes());
        block[2..4].copy_from_slice(&flags.to_le_bytes());
        block[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        block[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + payload.len()].copy_from_slice(payload);
        let addr = self.volume.append_block(&block)?;
        Ok(addr.offset())
    }

    /// Place an encoded blob across as many blocks as needed, keeping
    /// `min_free` blocks in reserve. Returns the first block offset.
    pub fn add_chunk(&mut self, payload: &[u8], min_free: u32) -> Result<u32> {
        if payload.is_empty() {
            return Err(StorageError::bad_data("empty chunk payload"));
        }
        if self.header.index_full() {
            return Err(StorageError::Overflow);
        }
        let nblocks = payload.len().div_ceil(BLOCK_PAYLOAD) as u32;
        if nblocks + min_free > self.free_blocks() {
            return Err(StorageError::Overflow);
        }
        let mut first = None;
        for (i, part) in payload.chunks(BLOCK_PAYLOAD).enumerate() {
            let flags = if i == 0 { 0 } else { FLAG_CONTINUATION };
            let offset = self.append_data_block(KIND_CHUNK, flags, part)?;
            first.get_or_insert(offset);
        }
        Ok(first.expect("payload is non-empty"))
    }

    /// Finalize a chunk: record its descriptor in the index, fold its
    /// bounds into the bounding box and rewrite the header.
    pub fn complete_chunk(&mut self, desc: ChunkDesc, bbox: BoundingBox) -> Result<()> {
        if self.header.index_full() {
            return Err(StorageError::Overflow);
        }
        self.header.index.push(desc);
        self.header.count = self.header.index.len() as u32;
        if !bbox.is_empty() {
            self.header.bbox.update(bbox.min_id, bbox.min_ts);
            self.header.bbox.update(bbox.max_id, bbox.max_ts);
        }
        self.sync_header()
    }

    /// Place a single uncompressed entry in one data block.
    pub fn add_entry(
        &mut self,
        series_id: SeriesId,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<u32> {
        if ENTRY_HDR_SIZE + payload.len() > BLOCK_PAYLOAD {
            return Err(StorageError::Overflow);
        }
        if self.header.index_full() || self.free_blocks() == 0 {
            return Err(StorageError::Overflow);
        }
        let mut body = Vec::with_capacity(ENTRY_HDR_SIZE + payload.len());
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.extend_from_slice(&series_id.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(payload);
        let offset = self.append_data_block(KIND_ENTRY, 0, &body)?;
        self.header.index.push(ChunkDesc {
            timestamp,
            block_offset: offset,
            length: body.len() as u32,
        });
        self.header.count = self.header.index.len() as u32;
        self.header.bbox.update(series_id, timestamp);
        self.sync_header()?;
        Ok(offset)
    }

    /// Reassemble a chunk payload from its blocks.
    pub fn read_chunk(&mut self, desc: &ChunkDesc) -> Result<Vec<u8>> {
        let nblocks = (desc.length as usize).div_ceil(BLOCK_PAYLOAD) as u32;
        let mut payload = Vec::with_capacity(desc.length as usize);
        for i in 0..nblocks {
            let block = self.volume.read_block(desc.block_offset + i)?;
            let kind = u16::from_le_bytes(block[0..2].try_into().unwrap());
            let flags = u16::from_le_bytes(block[2..4].try_into().unwrap());
            let len = u32::from_le_bytes(block[4..8].try_into().unwrap()) as usize;
            if kind != KIND_CHUNK || len > BLOCK_PAYLOAD {
                return Err(StorageError::bad_data("corrupt chunk block"));
            }
            let want_cont = i != 0;
            if (flags & FLAG_CONTINUATION != 0) != want_cont {
                return Err(StorageError::bad_data("chunk continuation mismatch"));
            }
            payload.extend_from_slice(&block[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + len]);
        }
        if payload.len() != desc.length as usize {
            return Err(StorageError::bad_data("chunk length mismatch"));
        }
        Ok(payload)
    }
}
