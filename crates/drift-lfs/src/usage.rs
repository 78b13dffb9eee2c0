//! The segment usage array: live-byte accounting per segment and the
//! clean/dirty/full classification driving the log writer and cleaner.
//!
//! A segment is clean if it contains no live data, dirty if it is not
//! clean and has no more live bytes than the dirty threshold, and full
//! otherwise. Clean and dirty segments are threaded onto intrusive
//! doubly-linked lists through link indices inside the entries; the
//! checkpoint persists the links and counters verbatim, so recovery
//! re-derives nothing.

use serde::{Deserialize, Serialize};

/// List link sentinel.
pub const NIL: i32 = -1;

const PREV: usize = 0;
const NEXT: usize = 1;

pub const SEG_USAGE_CLEAN: u16 = 0x1;
pub const SEG_USAGE_DIRTY: u16 = 0x2;

/// Per-segment usage record. The two link fields thread the entry onto
/// the clean or dirty list, matching the flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegUsageEntry {
    pub active_bytes: i32,
    pub flags: u16,
    pub links: [i32; 2],
}

impl SegUsageEntry {
    fn new() -> Self {
        Self {
            active_bytes: 0,
            flags: 0,
            links: [NIL, NIL],
        }
    }
}

/// The persisted head of the usage map: current segment, both list
/// heads/tails, the classification threshold, and the counters. The
/// `links` arrays hold `[tail, head]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCheckpoint {
    pub current_segment: i32,
    pub clean_links: [i32; 2],
    pub dirty_links: [i32; 2],
    pub dirty_threshold: i32,
    pub num_clean: i32,
    pub num_dirty: i32,
    pub free_blocks: i32,
}

/// Which intrusive list an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    Clean,
    Dirty,
}

/// Segment numbers handed to the log writer when it moves to a fresh
/// segment, so it can chain log pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRange {
    pub prev: i32,
    pub current: i32,
    pub next_clean: i32,
}

pub struct SegUsage {
    pub cp: UsageCheckpoint,
    pub entries: Vec<SegUsageEntry>,
    segment_size: i32,
    block_size: i32,
    clean_range_low: i32,
}

impl SegUsage {
    /// Fresh usage map for a newly formatted store: every segment clean.
    pub fn format(segment_count: u32, segment_size: u32, block_size: u32, dirty_threshold: u32) -> Self {
        let mut usage = Self {
            cp: UsageCheckpoint {
                current_segment: NIL,
                clean_links: [NIL, NIL],
                dirty_links: [NIL, NIL],
                dirty_threshold: dirty_threshold as i32,
                num_clean: 0,
                num_dirty: 0,
                free_blocks: 0,
            },
            entries: vec![SegUsageEntry::new(); segment_count as usize],
            segment_size: segment_size as i32,
            block_size: block_size as i32,
            clean_range_low: 0,
        };
        for seg in 0..segment_count as i32 {
            usage.add_to_list(ListId::Clean, seg);
            usage.entries[seg as usize].flags = SEG_USAGE_CLEAN;
            usage.cp.num_clean += 1;
            usage.cp.free_blocks += (segment_size / block_size) as i32;
        }
        usage
    }

    /// Rebuild from a loaded checkpoint. The persisted links and counters
    /// are authoritative.
    pub fn attach(
        cp: UsageCheckpoint,
        entries: Vec<SegUsageEntry>,
        segment_size: u32,
        block_size: u32,
        clean_range_low: u32,
    ) -> Self {
        Self {
            cp,
            entries,
            segment_size: segment_size as i32,
            block_size: block_size as i32,
            clean_range_low: clean_range_low as i32,
        }
    }

    pub fn set_clean_range_low(&mut self, v: i32) {
        self.clean_range_low = v;
    }

    pub fn segment_size(&self) -> i32 {
        self.segment_size
    }

    fn bytes_to_blocks(&self, bytes: i32) -> i32 {
        bytes / self.block_size
    }

    /// Blocks-in for a byte delta, rounded to the block quantum.
    fn rounded_blocks(&self, bytes: i32) -> i32 {
        self.bytes_to_blocks(bytes + self.block_size / 2)
    }

    /// Set the usage level of a segment. Zero cleans the segment; a
    /// negative value is a relative decrement floored at one byte, so a
    /// segment can only become clean through an explicit zero.
    pub fn set_usage(&mut self, seg: i32, active_bytes: i32) {
        let mut active = active_bytes;
        let entry = self.entries[seg as usize];

        if active == 0 {
            if seg == self.cp.current_segment {
                panic!("cleaning the segment currently being written");
            }
            self.cp.free_blocks += self.rounded_blocks(entry.active_bytes);
            if entry.flags & SEG_USAGE_DIRTY != 0 {
                self.remove_from_list(ListId::Dirty, seg);
                self.entries[seg as usize].flags &= !SEG_USAGE_DIRTY;
                self.cp.num_dirty -= 1;
            }
            if self.entries[seg as usize].flags & SEG_USAGE_CLEAN == 0 {
                self.add_to_list(ListId::Clean, seg);
                self.entries[seg as usize].flags |= SEG_USAGE_CLEAN;
                self.cp.num_clean += 1;
            }
            self.entries[seg as usize].active_bytes = 0;
            return;
        }

        if active < 0 {
            active = entry.active_bytes + active;
        }
        if active <= 0 {
            // A relative decrement can never clean a segment by itself.
            active = 1;
        }
        debug_assert!(active > 0);

        let change = entry.active_bytes - active;
        if change < 0 {
            self.cp.free_blocks -= self.rounded_blocks(-change);
        } else {
            self.cp.free_blocks += self.rounded_blocks(change);
        }

        if self.entries[seg as usize].flags & SEG_USAGE_CLEAN != 0 {
            self.remove_from_list(ListId::Clean, seg);
            self.entries[seg as usize].flags &= !SEG_USAGE_CLEAN;
            self.cp.num_clean -= 1;
        }

        if active <= self.cp.dirty_threshold && seg != self.cp.current_segment {
            if self.entries[seg as usize].flags & SEG_USAGE_DIRTY != 0 {
                self.entries[seg as usize].active_bytes = active;
                return;
            }
            self.add_to_list(ListId::Dirty, seg);
            self.entries[seg as usize].active_bytes = active;
            self.entries[seg as usize].flags |= SEG_USAGE_DIRTY;
            self.cp.num_dirty += 1;
            return;
        }

        // Neither clean nor dirty: just full.
        if self.entries[seg as usize].flags & SEG_USAGE_DIRTY != 0 {
            self.remove_from_list(ListId::Dirty, seg);
            self.entries[seg as usize].flags &= !SEG_USAGE_DIRTY;
            self.cp.num_dirty -= 1;
        }
        self.entries[seg as usize].active_bytes = active;
    }

    /// Blocks are no longer needed: decrement each owning segment by
    /// `size` bytes and nil out the addresses.
    pub fn free_blocks(&mut self, size: i32, addrs: &mut [u32], blocks_per_segment: u32) {
        for addr in addrs.iter_mut() {
            if *addr != crate::NIL_ADDR {
                let seg = (*addr / blocks_per_segment) as i32;
                self.set_usage(seg, -size);
            }
            *addr = crate::NIL_ADDR;
        }
    }

    /// Move the dirty threshold and reclassify segments the new level
    /// makes dirty.
    pub fn set_dirty_threshold(&mut self, threshold: i32) {
        self.cp.dirty_threshold = threshold;
        for seg in 0..self.entries.len() as i32 {
            if seg == self.cp.current_segment {
                continue;
            }
            let entry = self.entries[seg as usize];
            if entry.active_bytes <= threshold
                && entry.flags & (SEG_USAGE_CLEAN | SEG_USAGE_DIRTY) == 0
            {
                self.set_usage(seg, entry.active_bytes);
            }
        }
    }

    /// Pop the next clean segment for the log writer. The popped segment
    /// becomes the head of the log, marked with the full segment size so
    /// it is neither clean nor dirty while being written.
    pub fn get_clean_segment(&mut self) -> Option<LogRange> {
        let head = self.cp.clean_links[NEXT];
        if head == NIL {
            return None;
        }
        let prev = self.cp.current_segment;
        self.cp.current_segment = head;
        self.set_usage(head, self.segment_size);
        Some(LogRange {
            prev,
            current: head,
            next_clean: self.cp.clean_links[NEXT],
        })
    }

    /// Collect up to `max_out` segments for the cleaner, in dirty-list
    /// head order, skipping segments at or below the clean-range floor.
    pub fn get_segments_to_clean(&self, max_out: usize) -> Vec<i32> {
        let mut out = Vec::new();
        let mut seg = self.cp.dirty_links[NEXT];
        while out.len() < max_out && seg != NIL {
            let entry = &self.entries[seg as usize];
            if self.clean_range_low < entry.active_bytes {
                out.push(seg);
            }
            seg = entry.links[NEXT];
        }
        out
    }

    // ========================================================================
    // Intrusive list arithmetic
    // ========================================================================

    fn list_links(&mut self, list: ListId) -> &mut [i32; 2] {
        match list {
            ListId::Clean => &mut self.cp.clean_links,
            ListId::Dirty => &mut self.cp.dirty_links,
        }
    }

    fn remove_from_list(&mut self, list: ListId, seg: i32) {
        let head = self.list_links(list)[NEXT];
        if seg == head {
            let next = self.entries[seg as usize].links[NEXT];
            self.list_links(list)[NEXT] = next;
            if next != NIL {
                self.entries[next as usize].links[PREV] = NIL;
            } else {
                self.list_links(list)[PREV] = NIL;
            }
        } else {
            let prev = self.entries[seg as usize].links[PREV];
            let next = self.entries[seg as usize].links[NEXT];
            if prev == NIL {
                panic!("segment list is malformed");
            }
            self.entries[prev as usize].links[NEXT] = next;
            let tail = self.list_links(list)[PREV];
            if seg != tail {
                if next == NIL {
                    panic!("segment list is malformed");
                }
                self.entries[next as usize].links[PREV] = prev;
            } else {
                self.list_links(list)[PREV] = prev;
            }
        }
        self.entries[seg as usize].links = [NIL, NIL];
    }

    fn add_to_list(&mut self, list: ListId, seg: i32) {
        let tail = self.list_links(list)[PREV];
        self.entries[seg as usize].links[NEXT] = NIL;
        self.entries[seg as usize].links[PREV] = tail;
        if tail == NIL {
            // List was empty.
            self.list_links(list)[NEXT] = seg;
        } else {
            self.entries[tail as usize].links[NEXT] = seg;
        }
        self.list_links(list)[PREV] = seg;
    }

    // ========================================================================
    // Invariant checking
    // ========================================================================

    /// Verify the classification and list invariants. An error here
    /// means the map is untrustworthy.
    pub fn check_invariants(&self) -> Result<(), String> {
        let current = self.cp.current_segment;
        let mut num_clean = 0;
        let mut num_dirty = 0;
        for (i, e) in self.entries.iter().enumerate() {
            let seg = i as i32;
            let clean = e.flags & SEG_USAGE_CLEAN != 0;
            let dirty = e.flags & SEG_USAGE_DIRTY != 0;
            if clean && dirty {
                return Err(format!("segment {seg} is both clean and dirty"));
            }
            if clean != (e.active_bytes == 0 && seg != current) {
                return Err(format!(
                    "segment {seg}: clean flag {clean} vs activeBytes {} (current {current})",
                    e.active_bytes
                ));
            }
            if dirty
                != (e.active_bytes > 0
                    && e.active_bytes <= self.cp.dirty_threshold
                    && seg != current)
            {
                return Err(format!(
                    "segment {seg}: dirty flag {dirty} vs activeBytes {} threshold {}",
                    e.active_bytes, self.cp.dirty_threshold
                ));
            }
            if clean {
                num_clean += 1;
            }
            if dirty {
                num_dirty += 1;
            }
        }
        if num_clean != self.cp.num_clean {
            return Err(format!(
                "numClean counter {} vs {} flagged segments",
                self.cp.num_clean, num_clean
            ));
        }
        if num_dirty != self.cp.num_dirty {
            return Err(format!(
                "numDirty counter {} vs {} flagged segments",
                self.cp.num_dirty, num_dirty
            ));
        }
        self.check_list(self.cp.clean_links, SEG_USAGE_CLEAN, num_clean, "clean")?;
        self.check_list(self.cp.dirty_links, SEG_USAGE_DIRTY, num_dirty, "dirty")?;
        Ok(())
    }

    fn check_list(
        &self,
        links: [i32; 2],
        flag: u16,
        expected: i32,
        name: &str,
    ) -> Result<(), String> {
        let mut seen = 0;
        let mut prev = NIL;
        let mut seg = links[NEXT];
        while seg != NIL {
            let e = &self.entries[seg as usize];
            if e.flags & flag == 0 {
                return Err(format!("segment {seg} on the {name} list without the flag"));
            }
            if e.links[PREV] != prev {
                return Err(format!("segment {seg}: back link broken on the {name} list"));
            }
            seen += 1;
            if seen > self.entries.len() as i32 {
                return Err(format!("{name} list contains a cycle"));
            }
            prev = seg;
            seg = e.links[NEXT];
        }
        if prev != links[PREV] {
            return Err(format!("{name} list tail pointer does not match the walk"));
        }
        if seen != expected {
            return Err(format!(
                "{name} list holds {seen} segments, counters say {expected}"
            ));
        }
        Ok(())
    }
}
