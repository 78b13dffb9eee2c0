//! The descriptor map: for every allocated file number, the disk address
//! of the block holding its descriptor, its access time, and its version
//! number. An allocation bitmap rides alongside.

use crate::{LfsError, Result, NIL_ADDR};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescMapEntry {
    pub disk_addr: u32,
    pub access_time: i64,
    pub version: u32,
}

impl DescMapEntry {
    fn new() -> Self {
        Self {
            disk_addr: NIL_ADDR,
            access_time: 0,
            version: 0,
        }
    }
}

/// Persisted descriptor-map head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescCheckpoint {
    pub max_desc: u32,
    pub num_alloc: u32,
    /// Rotating allocation cursor.
    pub cursor: u32,
    /// Version timestamp source; advances by two per new file so a stale
    /// cached copy of a reused descriptor can never revalidate.
    pub timestamp: u32,
}

pub struct DescMap {
    pub cp: DescCheckpoint,
    pub entries: Vec<DescMapEntry>,
    pub bitmap: Vec<u64>,
}

impl DescMap {
    pub fn format(max_desc: u32) -> Self {
        Self {
            cp: DescCheckpoint {
                max_desc,
                num_alloc: 0,
                cursor: 0,
                timestamp: 2,
            },
            entries: vec![DescMapEntry::new(); max_desc as usize],
            bitmap: vec![0u64; (max_desc as usize).div_ceil(64)],
        }
    }

    pub fn attach(cp: DescCheckpoint, entries: Vec<DescMapEntry>, bitmap: Vec<u64>) -> Self {
        Self {
            cp,
            entries,
            bitmap,
        }
    }

    fn is_allocated(&self, file_num: u32) -> bool {
        self.bitmap[(file_num / 64) as usize] & (1u64 << (file_num % 64)) != 0
    }

    fn set_allocated(&mut self, file_num: u32, on: bool) {
        let word = &mut self.bitmap[(file_num / 64) as usize];
        if on {
            *word |= 1u64 << (file_num % 64);
        } else {
            *word &= !(1u64 << (file_num % 64));
        }
    }

    fn checked(&self, file_num: u32) -> Result<()> {
        if file_num >= self.cp.max_desc {
            return Err(LfsError::InvalidArgument(format!(
                "file number {file_num} out of range"
            )));
        }
        if !self.is_allocated(file_num) {
            return Err(LfsError::NoSuchFile(file_num));
        }
        Ok(())
    }

    /// Allocate an unused file number, scanning from the rotating cursor.
    /// The fresh descriptor gets a version two beyond any previously
    /// handed out.
    pub fn alloc_file_num(&mut self) -> Result<u32> {
        if self.cp.num_alloc >= self.cp.max_desc {
            return Err(LfsError::OutOfResources("no free file numbers"));
        }
        let max = self.cp.max_desc;
        for i in 0..max {
            let file_num = (self.cp.cursor + i) % max;
            if !self.is_allocated(file_num) {
                self.set_allocated(file_num, true);
                self.cp.cursor = (file_num + 1) % max;
                self.cp.num_alloc += 1;
                self.cp.timestamp += 2;
                self.entries[file_num as usize] = DescMapEntry {
                    disk_addr: NIL_ADDR,
                    access_time: 0,
                    version: self.cp.timestamp,
                };
                return Ok(file_num);
            }
        }
        Err(LfsError::OutOfResources("no free file numbers"))
    }

    /// Return a file number to the free pool.
    pub fn free_file_num(&mut self, file_num: u32) -> Result<()> {
        self.checked(file_num)?;
        self.set_allocated(file_num, false);
        self.cp.num_alloc -= 1;
        self.entries[file_num as usize].disk_addr = NIL_ADDR;
        Ok(())
    }

    pub fn disk_addr(&self, file_num: u32) -> Result<u32> {
        self.checked(file_num)?;
        let addr = self.entries[file_num as usize].disk_addr;
        if addr == NIL_ADDR {
            return Err(LfsError::NoSuchFile(file_num));
        }
        Ok(addr)
    }

    /// Point the file number at the block now holding its descriptor;
    /// the log writer and the cleaner both come through here.
    pub fn set_disk_addr(&mut self, file_num: u32, addr: u32) -> Result<()> {
        self.checked(file_num)?;
        self.entries[file_num as usize].disk_addr = addr;
        Ok(())
    }

    pub fn access_time(&self, file_num: u32) -> Result<i64> {
        self.checked(file_num)?;
        Ok(self.entries[file_num as usize].access_time)
    }

    pub fn set_access_time(&mut self, file_num: u32, time: i64) -> Result<()> {
        self.checked(file_num)?;
        self.entries[file_num as usize].access_time = time;
        Ok(())
    }

    pub fn version(&self, file_num: u32) -> Result<u32> {
        self.checked(file_num)?;
        Ok(self.entries[file_num as usize].version)
    }

    /// Bump the version, invalidating cached copies of the old
    /// incarnation (truncate-to-zero path).
    pub fn inc_version(&mut self, file_num: u32) -> Result<u32> {
        self.checked(file_num)?;
        let entry = &mut self.entries[file_num as usize];
        entry.version += 1;
        Ok(entry.version)
    }

    pub fn free_count(&self) -> u32 {
        self.cp.max_desc - self.cp.num_alloc
    }

    /// Every allocated file number with its entry.
    pub fn iter_allocated(&self) -> Vec<(u32, DescMapEntry)> {
        (0..self.cp.max_desc)
            .filter(|f| self.is_allocated(*f))
            .map(|f| (f, self.entries[f as usize]))
            .collect()
    }
}
