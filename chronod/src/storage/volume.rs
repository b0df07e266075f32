//! Fixed-size block I/O over preallocated volume files, plus the
//! meta-volume that tracks the ring.
//!
//! A volume is `capacity` blocks of 4 KiB. Writes are append-only through
//! `write_pos`; reads are served from a read-only memory map when one
//! could be established, with a copying file-read fallback. Any write
//! error below this layer is unrecoverable and panics.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use memmap2::Mmap;

use crate::error::{Result, StorageError};
use crate::types::{BlockAddr, BLOCK_SIZE};

fn fatal<T>(res: std::io::Result<T>, msg: &str) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            log::error!("{msg}: {e}");
            panic!("{msg}: {e}");
        }
    }
}

/// Ask the kernel for transparent huge pages on the mapping. Best effort.
fn advise_hugepages(map: &Mmap) {
    const MADV_HUGEPAGE: libc::c_int = 14;
    let ret = unsafe {
        libc::madvise(
            map.as_ptr() as *mut libc::c_void,
            map.len(),
            MADV_HUGEPAGE,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("MADV_HUGEPAGE failed ({err}), continuing without huge pages");
    }
}

pub struct Volume {
    id: u32,
    file: File,
    path: PathBuf,
    capacity: u32,
    write_pos: u32,
    mmap: Option<Mmap>,
}

impl Volume {
    /// Create a volume file of `capacity` blocks filled with zeroes.
    pub fn create_new(path: &Path, capacity: u32) -> std::io::Result<()> {
        info!(
            "creating volume {} ({} blocks, {} bytes)",
            path.display(),
            capacity,
            capacity as u64 * BLOCK_SIZE as u64
        );
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        file.set_len(capacity as u64 * BLOCK_SIZE as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Open an existing volume file. `write_pos` is restored by the caller
    /// from the page header or the meta-volume.
    pub fn open_existing(id: u32, path: &Path, huge_tlb: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        let capacity = (file_size / BLOCK_SIZE as u64) as u32;
        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                if huge_tlb {
                    advise_hugepages(&map);
                }
                Some(map)
            }
            Err(e) => {
                warn!(
                    "{}: memory mapping error: {e}, falling back to file reads",
                    path.display()
                );
                None
            }
        };
        Ok(Self {
            id,
            file,
            path: path.to_path_buf(),
            capacity,
            write_pos: 0,
            mmap,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn write_pos(&self) -> u32 {
        self.write_pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn set_write_pos(&mut self, pos: u32) {
        self.write_pos = pos.min(self.capacity);
    }

    /// Append one block at `write_pos`.
    pub fn append_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<BlockAddr> {
        if self.write_pos >= self.capacity {
            return Err(StorageError::Overflow);
        }
        let offset = self.write_pos as u64 * BLOCK_SIZE as u64;
        fatal(self.file.seek(SeekFrom::Start(offset)), "volume seek error");
        fatal(self.file.write_all(block), "volume write error");
        let ix = self.write_pos;
        self.write_pos += 1;
        Ok(BlockAddr::new(self.id, ix))
    }

    /// Rewrite an already-appended block in place (page header sync).
    pub(crate) fn overwrite_block(&mut self, ix: u32, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        if ix >= self.write_pos {
            return Err(StorageError::bad_data("block index beyond write position"));
        }
        let offset = ix as u64 * BLOCK_SIZE as u64;
        fatal(self.file.seek(SeekFrom::Start(offset)), "volume seek error");
        fatal(self.file.write_all(block), "volume write error");
        Ok(())
    }

    /// Copying read of one block.
    pub fn read_block(&mut self, ix: u32) -> Result<[u8; BLOCK_SIZE]> {
        if ix >= self.write_pos {
            return Err(StorageError::bad_data("block index beyond write position"));
        }
        self.read_block_raw(ix)
    }

    /// Copying read without the `write_pos` bound. Used during crash
    /// recovery before the write position is known.
    pub(crate) fn read_block_raw(&mut self, ix: u32) -> Result<[u8; BLOCK_SIZE]> {
        if ix >= self.capacity {
            return Err(StorageError::bad_data("block index beyond capacity"));
        }
        let mut block = [0u8; BLOCK_SIZE];
        if let Some(map) = &self.mmap {
            let at = ix as usize * BLOCK_SIZE;
            block.copy_from_slice(&map[at..at + BLOCK_SIZE]);
            return Ok(block);
        }
        let offset = ix as u64 * BLOCK_SIZE as u64;
        fatal(self.file.seek(SeekFrom::Start(offset)), "volume seek error");
        fatal(self.file.read_exact(&mut block), "volume read error");
        Ok(block)
    }

    /// Borrow a block from the memory map, if one exists.
    pub fn read_block_zero_copy(&self, ix: u32) -> Result<&[u8]> {
        if ix >= self.write_pos {
            return Err(StorageError::bad_data("block index beyond write position"));
        }
        match &self.mmap {
            Some(map) => {
                let at = ix as usize * BLOCK_SIZE;
                Ok(&map[at..at + BLOCK_SIZE])
            }
            None => Err(StorageError::Unavailable),
        }
    }

    pub fn flush(&mut self) {
        fatal(self.file.sync_data(), "volume fsync error");
    }

    /// Zero the write position. Previously appended blocks will be
    /// overwritten by subsequent appends.
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }
}

/// Descriptor for one volume, as stored in a meta-volume sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDesc {
    pub version: u32,
    pub id: u32,
    pub nblocks: u32,
    pub capacity: u32,
    pub generation: u32,
    pub path: String,
}

const META_PATH_MAX: usize = BLOCK_SIZE - 5 * 4;

impl VolumeDesc {
    fn to_sector(&self) -> Result<[u8; BLOCK_SIZE]> {
        if self.path.len() >= META_PATH_MAX {
            return Err(StorageError::bad_data("volume path too long"));
        }
        let mut sector = [0u8; BLOCK_SIZE];
        sector[0..4].copy_from_slice(&self.version.to_le_bytes());
        sector[4..8].copy_from_slice(&self.id.to_le_bytes());
        sector[8..12].copy_from_slice(&self.nblocks.to_le_bytes());
        sector[12..16].copy_from_slice(&self.capacity.to_le_bytes());
        sector[16..20].copy_from_slice(&self.generation.to_le_bytes());
        sector[20..20 + self.path.len()].copy_from_slice(self.path.as_bytes());
        Ok(sector)
    }

    fn from_sector(sector: &[u8]) -> Result<Self> {
        let u32_at = |at: usize| {
            u32::from_le_bytes(sector[at..at + 4].try_into().unwrap())
        };
        let path_bytes = &sector[20..];
        let end = path_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(path_bytes.len());
        let path = std::str::from_utf8(&path_bytes[..end])
            .map_err(|_| StorageError::bad_data("volume path is not utf-8"))?
            .to_string();
        Ok(Self {
            version: u32_at(0),
            id: u32_at(4),
            nblocks: u32_at(8),
            capacity: u32_at(12),
            generation: u32_at(16),
            path,
        })
    }
}

struct MetaInner {
    file: File,
    descs: Vec<VolumeDesc>,
}

/// Sector-per-volume descriptor file beside the data volumes. Updates go
/// to the in-memory double buffer and the sector file; the dirty flag
/// schedules persistence through the catalog.
pub struct MetaVolume {
    inner: Mutex<MetaInner>,
    dirty: AtomicBool,
}

impl MetaVolume {
    pub fn create_new(path: &Path, descs: Vec<VolumeDesc>) -> Result<Self> {
        let file = fatal(
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(path),
            "meta-volume create error",
        );
        let meta = Self {
            inner: Mutex::new(MetaInner { file, descs }),
            dirty: AtomicBool::new(true),
        };
        meta.write_all_sectors()?;
        Ok(meta)
    }

    pub fn open_existing(path: &Path) -> Result<Self> {
        let mut file = fatal(
            OpenOptions::new().read(true).write(true).open(path),
            "meta-volume open error",
        );
        let size = fatal(file.metadata(), "meta-volume stat error").len() as usize;
        if size % BLOCK_SIZE != 0 {
            return Err(StorageError::bad_data("meta-volume is not sector aligned"));
        }
        let mut descs = Vec::with_capacity(size / BLOCK_SIZE);
        let mut sector = [0u8; BLOCK_SIZE];
        fatal(file.seek(SeekFrom::Start(0)), "meta-volume seek error");
        for _ in 0..size / BLOCK_SIZE {
            fatal(file.read_exact(&mut sector), "meta-volume read error");
            descs.push(VolumeDesc::from_sector(&sector)?);
        }
        Ok(Self {
            inner: Mutex::new(MetaInner { file, descs }),
            dirty: AtomicBool::new(false),
        })
    }

    fn write_all_sectors(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        fatal(inner.file.seek(SeekFrom::Start(0)), "meta-volume seek error");
        let sectors: Vec<_> = inner
            .descs
            .iter()
            .map(VolumeDesc::to_sector)
            .collect::<Result<_>>()?;
        for sector in &sectors {
            fatal(inner.file.write_all(sector), "meta-volume write error");
        }
        fatal(inner.file.sync_data(), "meta-volume fsync error");
        Ok(())
    }

    fn write_sector(inner: &mut MetaInner, ix: usize) {
        let sector = inner.descs[ix]
            .to_sector()
            .expect("descriptor was validated on insert");
        let offset = ix as u64 * BLOCK_SIZE as u64;
        fatal(inner.file.seek(SeekFrom::Start(offset)), "meta-volume seek error");
        fatal(inner.file.write_all(&sector), "meta-volume write error");
    }

    pub fn nvolumes(&self) -> usize {
        self.inner.lock().unwrap().descs.len()
    }

    pub fn descs(&self) -> Vec<VolumeDesc> {
        self.inner.lock().unwrap().descs.clone()
    }

    pub fn nblocks(&self, id: u32) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .descs
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.nblocks)
            .ok_or_else(|| StorageError::bad_data("unknown volume id"))
    }

    pub fn generation(&self, id: u32) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .descs
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.generation)
            .ok_or_else(|| StorageError::bad_data("unknown volume id"))
    }

    pub fn set_nblocks(&self, id: u32, nblocks: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ix = inner
            .descs
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| StorageError::bad_data("unknown volume id"))?;
        inner.descs[ix].nblocks = nblocks;
        Self::write_sector(&mut inner, ix);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Increment the generation counter; called on every volume reset.
    pub fn bump_generation(&self, id: u32) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let ix = inner
            .descs
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| StorageError::bad_data("unknown volume id"))?;
        inner.descs[ix].generation += 1;
        let generation = inner.descs[ix].generation;
        Self::write_sector(&mut inner, ix);
        self.dirty.store(true, Ordering::Release);
        Ok(generation)
    }

    pub fn flush(&self) {
        let inner = self.inner.lock().unwrap();
        fatal(inner.file.sync_data(), "meta-volume fsync error");
    }

    /// Take the dirty descriptors for catalog persistence, clearing the
    /// flag. Returns `None` when nothing changed since the last call.
    pub fn take_dirty(&self) -> Option<Vec<VolumeDesc>> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.descs())
        } else {
            None
        }
    }
}
