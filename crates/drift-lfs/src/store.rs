//! On-disk layout of a store: a directory holding the superblock, the
//! segment file, and the checkpoint image. Checkpoint writes go through
//! a temp file and an atomic rename.

use crate::descmap::{DescCheckpoint, DescMapEntry};
use crate::usage::{SegUsageEntry, UsageCheckpoint};
use crate::{Geometry, LfsError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SUPERBLOCK_FILE: &str = "superblock.bin";
pub const SEGMENTS_FILE: &str = "segments.dat";
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";

const SUPER_MAGIC: u32 = 0x4c_46_53_31; // "LFS1"

#[derive(Debug, Serialize, Deserialize)]
struct Superblock {
    magic: u32,
    geometry: Geometry,
}

/// The durable snapshot: usage header then its array, descriptor-map
/// header then its array and bitmap. Counters and list links load back
/// verbatim; nothing is re-derived on recovery.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub usage_cp: UsageCheckpoint,
    pub usage_entries: Vec<SegUsageEntry>,
    pub desc_cp: DescCheckpoint,
    pub desc_entries: Vec<DescMapEntry>,
    pub desc_bitmap: Vec<u64>,
    /// Writer cursor inside the current segment, so a restart resumes
    /// the log exactly where the checkpoint left it.
    pub write_block: u32,
    pub live_bytes: i32,
}

/// Block-granular access to the segment file.
pub struct SegFile {
    file: File,
    geometry: Geometry,
}

impl SegFile {
    pub fn create(dir: &Path, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(SEGMENTS_FILE))?;
        file.set_len(geometry.segment_count as u64 * geometry.segment_size as u64)?;
        Ok(Self { file, geometry })
    }

    pub fn open(dir: &Path, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(SEGMENTS_FILE))?;
        Ok(Self { file, geometry })
    }

    fn block_offset(&self, addr: u32) -> u64 {
        addr as u64 * self.geometry.block_size as u64
    }

    pub fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= self.geometry.block_size as usize);
        self.file.seek(SeekFrom::Start(self.block_offset(addr)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn read_block(&mut self, addr: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.block_size as usize];
        self.file.seek(SeekFrom::Start(self.block_offset(addr)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_segment(&mut self, seg: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.segment_size as usize];
        self.file
            .seek(SeekFrom::Start(seg as u64 * self.geometry.segment_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

pub fn write_superblock(dir: &Path, geometry: Geometry) -> Result<()> {
    let sb = Superblock {
        magic: SUPER_MAGIC,
        geometry,
    };
    atomic_write(&dir.join(SUPERBLOCK_FILE), &bincode::serialize(&sb)?)
}

pub fn read_superblock(dir: &Path) -> Result<Geometry> {
    let bytes = std::fs::read(dir.join(SUPERBLOCK_FILE))?;
    let sb: Superblock = bincode::deserialize(&bytes)?;
    if sb.magic != SUPER_MAGIC {
        return Err(LfsError::Inconsistency(
            "bad superblock magic".to_string(),
        ));
    }
    Ok(sb.geometry)
}

pub fn write_checkpoint(dir: &Path, image: &CheckpointImage) -> Result<()> {
    atomic_write(&dir.join(CHECKPOINT_FILE), &bincode::serialize(image)?)
}

pub fn read_checkpoint(dir: &Path) -> Result<CheckpointImage> {
    let bytes = std::fs::read(dir.join(CHECKPOINT_FILE))?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Temp file plus rename so a crash leaves either the old image or the
/// new one, never a torn write.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp: PathBuf = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            segment_count: 4,
            segment_size: 4096,
            block_size: 1024,
        }
    }

    #[test]
    fn test_block_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = SegFile::create(dir.path(), geometry()).unwrap();

        f.write_block(5, b"hello block").unwrap();
        let back = f.read_block(5).unwrap();
        assert_eq!(&back[..11], b"hello block");
        assert_eq!(back.len(), 1024);
    }

    #[test]
    fn test_read_segment_covers_its_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = SegFile::create(dir.path(), geometry()).unwrap();

        // Segment 1 holds blocks 4..8.
        f.write_block(4, b"first").unwrap();
        f.write_block(7, b"last").unwrap();
        let seg = f.read_segment(1).unwrap();
        assert_eq!(&seg[..5], b"first");
        assert_eq!(&seg[3 * 1024..3 * 1024 + 4], b"last");
    }

    #[test]
    fn test_superblock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_superblock(dir.path(), geometry()).unwrap();
        assert_eq!(read_superblock(dir.path()).unwrap(), geometry());
    }

    #[test]
    fn test_superblock_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SUPERBLOCK_FILE), b"not a superblock xxxx").unwrap();
        assert!(read_superblock(dir.path()).is_err());
    }
}
