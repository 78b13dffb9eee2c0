//! The cleaner: read chosen dirty segments, copy the still-live blocks
//! to the head of the log, and hand the reclaimed segments back to the
//! clean list.

use crate::{Lfs, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Which blocks are still live, and where their owners keep pointers.
/// Liveness is decided outside the store (descriptor map plus per-block
/// ownership); pointer updates must land together with the copied block.
pub trait BlockOwner: Send + Sync {
    fn is_live(&self, addr: u32) -> bool;
    /// The block moved from `old` to `new`; repoint the owner.
    fn relocate(&self, old: u32, new: u32);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub segments_cleaned: usize,
    pub live_blocks_moved: usize,
    pub dead_blocks_discarded: usize,
}

impl Lfs {
    /// One cleaner pass over up to `max_segments` dirty segments.
    /// Cancellable between segments, never mid-segment; an over-read of
    /// blocks that died since the usage was recorded just discards them.
    pub fn clean(
        &self,
        owner: &dyn BlockOwner,
        max_segments: usize,
        cancel: &AtomicBool,
    ) -> Result<CleanStats> {
        let mut stats = CleanStats::default();
        let geometry = self.geometry();
        let bpseg = geometry.blocks_per_segment();

        for seg in self.segments_to_clean(max_segments) {
            if cancel.load(Ordering::SeqCst) {
                debug!(component = "LFS", "cleaner cancelled between segments");
                break;
            }
            let data = self.read_segment(seg as u32)?;
            for b in 0..bpseg {
                let addr = seg as u32 * bpseg + b;
                if owner.is_live(addr) {
                    let start = (b * geometry.block_size) as usize;
                    let block = &data[start..start + geometry.block_size as usize];
                    let new_addr = self.append_block(block)?;
                    owner.relocate(addr, new_addr);
                    stats.live_blocks_moved += 1;
                } else {
                    stats.dead_blocks_discarded += 1;
                }
            }
            self.set_usage(seg, 0);
            stats.segments_cleaned += 1;
        }

        if stats.segments_cleaned > 0 {
            info!(
                component = "LFS",
                segments = stats.segments_cleaned,
                moved = stats.live_blocks_moved,
                discarded = stats.dead_blocks_discarded,
                "cleaner pass complete"
            );
        }
        Ok(stats)
    }
}
