//! # drift-lfs
//!
//! The log-structured store core: segment usage accounting, selection of
//! the next segment to write and the segments to clean, the cleaner
//! pass, the descriptor map, and checkpoint plumbing.
//!
//! The store is a directory: a superblock fixing the geometry, one large
//! segment file, and a checkpoint image of the usage and descriptor
//! maps. All list and counter updates happen under one mutex per store;
//! segment I/O does not hold it.

pub mod cleaner;
pub mod descmap;
pub mod store;
pub mod usage;

pub use cleaner::{BlockOwner, CleanStats};
pub use descmap::{DescCheckpoint, DescMap, DescMapEntry};
pub use usage::{LogRange, SegUsage, SegUsageEntry, UsageCheckpoint, NIL};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Sentinel disk address ("no block").
pub const NIL_ADDR: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum LfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no such file number {0}")]
    NoSuchFile(u32),
    #[error("store state inconsistent: {0}")]
    Inconsistency(String),
}

pub type Result<T> = std::result::Result<T, LfsError>;

/// Fixed at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub segment_count: u32,
    pub segment_size: u32,
    pub block_size: u32,
}

impl Geometry {
    pub fn validate(&self) -> Result<()> {
        if self.segment_count < 2
            || self.block_size == 0
            || self.segment_size == 0
            || self.segment_size % self.block_size != 0
        {
            return Err(LfsError::InvalidArgument(format!(
                "bad geometry: {self:?}"
            )));
        }
        Ok(())
    }

    pub fn blocks_per_segment(&self) -> u32 {
        self.segment_size / self.block_size
    }
}

/// Tuning read at attach/format time.
#[derive(Debug, Clone, Copy)]
pub struct LfsTuning {
    pub dirty_threshold: u32,
    pub clean_range_low: u32,
    pub max_desc: u32,
}

impl Default for LfsTuning {
    fn default() -> Self {
        Self {
            dirty_threshold: 0,
            clean_range_low: 0,
            max_desc: 1024,
        }
    }
}

/// "df" numbers for operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub max_kbytes: u64,
    pub free_kbytes: u64,
    pub max_file_desc: u32,
    pub free_file_desc: u32,
    pub block_size: u32,
}

struct Inner {
    usage: SegUsage,
    desc: DescMap,
    /// Write cursor inside the current segment, in blocks.
    write_block: u32,
    /// Bytes appended to the current segment so far; becomes its usage
    /// level when the writer moves on.
    live_bytes: i32,
}

/// One mounted log-structured store.
pub struct Lfs {
    dir: PathBuf,
    geometry: Geometry,
    inner: Mutex<Inner>,
    file: Mutex<store::SegFile>,
}

impl Lfs {
    /// Create a store: superblock, zeroed segment file, a fresh usage
    /// map with every segment clean, and an initial checkpoint.
    pub fn format(dir: &Path, geometry: Geometry, tuning: LfsTuning) -> Result<Lfs> {
        geometry.validate()?;
        std::fs::create_dir_all(dir)?;
        store::write_superblock(dir, geometry)?;
        let file = store::SegFile::create(dir, geometry)?;

        let mut usage = SegUsage::format(
            geometry.segment_count,
            geometry.segment_size,
            geometry.block_size,
            tuning.dirty_threshold,
        );
        usage.set_clean_range_low(tuning.clean_range_low as i32);
        // The log needs a head before the first append.
        usage
            .get_clean_segment()
            .ok_or(LfsError::OutOfResources("no clean segment"))?;

        let lfs = Lfs {
            dir: dir.to_path_buf(),
            geometry,
            inner: Mutex::new(Inner {
                usage,
                desc: DescMap::format(tuning.max_desc),
                write_block: 0,
                live_bytes: 0,
            }),
            file: Mutex::new(file),
        };
        lfs.checkpoint()?;
        Ok(lfs)
    }

    /// Mount an existing store from its last checkpoint.
    pub fn attach(dir: &Path, tuning: LfsTuning) -> Result<Lfs> {
        let geometry = store::read_superblock(dir)?;
        geometry.validate()?;
        let file = store::SegFile::open(dir, geometry)?;
        let image = store::read_checkpoint(dir)?;

        let usage = SegUsage::attach(
            image.usage_cp,
            image.usage_entries,
            geometry.segment_size,
            geometry.block_size,
            tuning.clean_range_low,
        );
        usage
            .check_invariants()
            .map_err(LfsError::Inconsistency)?;
        let desc = DescMap::attach(image.desc_cp, image.desc_entries, image.desc_bitmap);

        info!(
            component = "LFS",
            log_end = usage.cp.current_segment,
            num_clean = usage.cp.num_clean,
            num_dirty = usage.cp.num_dirty,
            num_full = geometry.segment_count as i32 - usage.cp.num_clean - usage.cp.num_dirty,
            "attached store"
        );

        let inner = Inner {
            usage,
            desc,
            write_block: image.write_block,
            live_bytes: image.live_bytes,
        };

        Ok(Lfs {
            dir: dir.to_path_buf(),
            geometry,
            inner: Mutex::new(inner),
            file: Mutex::new(file),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    // ========================================================================
    // Usage map operations
    // ========================================================================

    pub fn set_usage(&self, seg: i32, active_bytes: i32) {
        self.inner.lock().unwrap().usage.set_usage(seg, active_bytes);
    }

    pub fn usage_of(&self, seg: i32) -> SegUsageEntry {
        self.inner.lock().unwrap().usage.entries[seg as usize]
    }

    pub fn usage_checkpoint(&self) -> UsageCheckpoint {
        self.inner.lock().unwrap().usage.cp
    }

    pub fn free_blocks(&self, size: i32, addrs: &mut [u32]) {
        self.inner
            .lock()
            .unwrap()
            .usage
            .free_blocks(size, addrs, self.geometry.blocks_per_segment());
    }

    pub fn set_dirty_threshold(&self, threshold: i32) {
        self.inner.lock().unwrap().usage.set_dirty_threshold(threshold);
    }

    pub fn get_clean_segment(&self) -> Result<LogRange> {
        self.inner
            .lock()
            .unwrap()
            .usage
            .get_clean_segment()
            .ok_or(LfsError::OutOfResources("no clean segment"))
    }

    pub fn segments_to_clean(&self, max_out: usize) -> Vec<i32> {
        self.inner.lock().unwrap().usage.get_segments_to_clean(max_out)
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .usage
            .check_invariants()
            .map_err(LfsError::Inconsistency)
    }

    // ========================================================================
    // Log writer
    // ========================================================================

    /// Append one block of live data to the head of the log, returning
    /// its disk address. Rolls to the next clean segment when the current
    /// one fills.
    pub fn append_block(&self, data: &[u8]) -> Result<u32> {
        if data.len() > self.geometry.block_size as usize {
            return Err(LfsError::InvalidArgument(format!(
                "block of {} bytes exceeds the block size",
                data.len()
            )));
        }
        let addr = {
            let mut inner = self.inner.lock().unwrap();
            if inner.write_block == self.geometry.blocks_per_segment() {
                Self::roll_segment(&mut inner)?;
            }
            let current = inner.usage.cp.current_segment as u32;
            let addr = current * self.geometry.blocks_per_segment() + inner.write_block;
            inner.write_block += 1;
            inner.live_bytes += self.geometry.block_size as i32;
            addr
        };
        self.file.lock().unwrap().write_block(addr, data)?;
        Ok(addr)
    }

    /// Move the writer onto the next clean segment; the finished
    /// segment's usage drops from the full-size marker to what was
    /// actually written.
    fn roll_segment(inner: &mut Inner) -> Result<()> {
        let written = inner.live_bytes;
        let range = inner
            .usage
            .get_clean_segment()
            .ok_or(LfsError::OutOfResources("no clean segment"))?;
        if range.prev != NIL {
            inner.usage.set_usage(range.prev, written);
        }
        inner.write_block = 0;
        inner.live_bytes = 0;
        Ok(())
    }

    pub fn read_block(&self, addr: u32) -> Result<Vec<u8>> {
        self.file.lock().unwrap().read_block(addr)
    }

    pub fn read_segment(&self, seg: u32) -> Result<Vec<u8>> {
        self.file.lock().unwrap().read_segment(seg)
    }

    // ========================================================================
    // Descriptor map operations
    // ========================================================================

    pub fn alloc_file_num(&self) -> Result<u32> {
        self.inner.lock().unwrap().desc.alloc_file_num()
    }

    pub fn free_file_num(&self, file_num: u32) -> Result<()> {
        self.inner.lock().unwrap().desc.free_file_num(file_num)
    }

    pub fn desc_addr(&self, file_num: u32) -> Result<u32> {
        self.inner.lock().unwrap().desc.disk_addr(file_num)
    }

    pub fn set_desc_addr(&self, file_num: u32, addr: u32) -> Result<()> {
        self.inner.lock().unwrap().desc.set_disk_addr(file_num, addr)
    }

    pub fn desc_access_time(&self, file_num: u32) -> Result<i64> {
        self.inner.lock().unwrap().desc.access_time(file_num)
    }

    pub fn set_desc_access_time(&self, file_num: u32, time: i64) -> Result<()> {
        self.inner.lock().unwrap().desc.set_access_time(file_num, time)
    }

    pub fn desc_version(&self, file_num: u32) -> Result<u32> {
        self.inner.lock().unwrap().desc.version(file_num)
    }

    pub fn inc_desc_version(&self, file_num: u32) -> Result<u32> {
        self.inner.lock().unwrap().desc.inc_version(file_num)
    }

    pub fn allocated_descriptors(&self) -> Vec<(u32, DescMapEntry)> {
        self.inner.lock().unwrap().desc.iter_allocated()
    }

    // ========================================================================
    // Checkpoint and df
    // ========================================================================

    /// Write a coherent snapshot of the usage and descriptor maps. Not
    /// cancellable once started; the invariants must hold at every
    /// checkpoint boundary, so they are verified first.
    pub fn checkpoint(&self) -> Result<()> {
        let image = {
            let inner = self.inner.lock().unwrap();
            inner
                .usage
                .check_invariants()
                .map_err(LfsError::Inconsistency)?;
            store::CheckpointImage {
                usage_cp: inner.usage.cp,
                usage_entries: inner.usage.entries.clone(),
                desc_cp: inner.desc.cp,
                desc_entries: inner.desc.entries.clone(),
                desc_bitmap: inner.desc.bitmap.clone(),
                write_block: inner.write_block,
                live_bytes: inner.live_bytes,
            }
        };
        self.file.lock().unwrap().sync()?;
        store::write_checkpoint(&self.dir, &image)
    }

    pub fn domain_info(&self) -> DomainInfo {
        let inner = self.inner.lock().unwrap();
        DomainInfo {
            max_kbytes: self.geometry.segment_count as u64 * self.geometry.segment_size as u64
                / 1024,
            free_kbytes: inner.usage.cp.free_blocks.max(0) as u64
                * self.geometry.block_size as u64
                / 1024,
            max_file_desc: inner.desc.cp.max_desc,
            free_file_desc: inner.desc.free_count(),
            block_size: self.geometry.block_size,
        }
    }
}
