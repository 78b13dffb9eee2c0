//! The client channel pool: allocation policy, reply reassembly state,
//! and the server congestion map.

use drift_proto::{BootGen, Frame, FrameHeader, HostId, LAST_COMMAND};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChanState {
    Free,
    Busy,
}

/// Reassembly state for the reply of the transaction currently on a
/// channel. Progress counters advance as fragments land; the call is
/// complete only when every declared fragment has been delivered.
pub(crate) struct Assembly {
    pub xid: u32,
    body: Vec<u8>,
    param_total: usize,
    data_total: usize,
    /// Bitmap of delivered fragment indices.
    delivered: u32,
    frag_count: u16,
    pub complete: bool,
    pub status: u16,
    pub boot_gen: BootGen,
    /// Host that actually answered; differs from the channel binding for
    /// broadcast calls.
    pub responder: HostId,
    pub got_ack: bool,
}

pub(crate) enum Ingest {
    Progress,
    Completed,
    /// Dropped silently: duplicate fragment, stale transaction, or a
    /// malformed size. The pool keeps a counter for the duplicates.
    Dropped(&'static str),
}

impl Assembly {
    pub(crate) fn new(xid: u32) -> Self {
        Self {
            xid,
            body: Vec::new(),
            param_total: 0,
            data_total: 0,
            delivered: 0,
            frag_count: 0,
            complete: false,
            status: 0,
            boot_gen: 0,
            responder: 0,
            got_ack: false,
        }
    }

    pub(crate) fn ingest(&mut self, frame: &Frame) -> Ingest {
        let h = &frame.header;
        if h.xid != self.xid {
            return Ingest::Dropped("stale transaction");
        }
        if self.complete {
            // Reject silently once actual param and data sizes are
            // satisfied.
            return Ingest::Dropped("duplicate after completion");
        }
        let count = h.frag_count as usize;
        if count == 0 || count > Frame::MAX_FRAGMENTS {
            return Ingest::Dropped("bad fragment count");
        }
        let total = h.param_size as usize + h.data_size as usize;
        if total > Frame::MAX_FRAGMENTS * Frame::MAX_FRAGMENT_PAYLOAD {
            return Ingest::Dropped("oversized reply");
        }
        if self.frag_count == 0 {
            // First fragment declares the reply shape.
            self.frag_count = h.frag_count;
            self.param_total = h.param_size as usize;
            self.data_total = h.data_size as usize;
            self.body = vec![0u8; total];
            self.status = h.status;
            self.boot_gen = h.boot_gen;
            self.responder = h.server_id;
        } else if self.frag_count != h.frag_count
            || self.param_total != h.param_size as usize
            || self.data_total != h.data_size as usize
        {
            return Ingest::Dropped("fragment shape mismatch");
        }
        if h.frag_index as usize >= count {
            return Ingest::Dropped("fragment index out of range");
        }
        let bit = 1u32 << h.frag_index;
        if self.delivered & bit != 0 {
            return Ingest::Dropped("duplicate fragment");
        }
        let start = h.frag_offset as usize;
        let end = start + frame.payload.len();
        if end > self.body.len() {
            return Ingest::Dropped("fragment outside body");
        }
        self.body[start..end].copy_from_slice(&frame.payload);
        self.delivered |= bit;
        if self.delivered.count_ones() as usize == count {
            self.complete = true;
            Ingest::Completed
        } else {
            Ingest::Progress
        }
    }

    /// Split the reassembled body into its parameter and data areas.
    pub(crate) fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        let mut body = self.body;
        let data = body.split_off(self.param_total);
        (body, data)
    }
}

pub(crate) struct ChannelSlot {
    pub state: ChanState,
    /// Last server this channel talked to; reuse gives that server an
    /// implicit acknowledgment.
    pub server: Option<HostId>,
    /// Advisory handle position echoed back to the server.
    pub server_hint: u32,
    pub notify: Arc<Notify>,
    pub assembly: Option<Assembly>,
}

/// Small fixed-size set of servers that recently returned a NACK. While
/// an entry is fresh the allocator restricts that server to one channel.
pub(crate) struct CongestionMap {
    entries: [Option<(HostId, Instant)>; Self::SLOTS],
}

impl CongestionMap {
    const SLOTS: usize = 8;

    fn new() -> Self {
        Self {
            entries: [None; Self::SLOTS],
        }
    }

    pub(crate) fn mark(&mut self, server: HostId) {
        let now = Instant::now();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .flatten()
            .find(|(id, _)| *id == server)
        {
            entry.1 = now;
            return;
        }
        match self.entries.iter_mut().find(|e| e.is_none()) {
            Some(slot) => *slot = Some((server, now)),
            None => warn!(
                component = "RPC",
                server, "no more room to keep track of congested servers"
            ),
        }
    }

    pub(crate) fn clear(&mut self, server: HostId) {
        for entry in self.entries.iter_mut() {
            if matches!(entry, Some((id, _)) if *id == server) {
                *entry = None;
            }
        }
    }

    /// True when the server was marked congested within `interval`.
    pub(crate) fn fresh(&self, server: HostId, interval: Duration) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|(id, at)| *id == server && at.elapsed() < interval)
    }

    fn contains(&self, server: HostId) -> bool {
        self.entries.iter().flatten().any(|(id, _)| *id == server)
    }
}

/// Counters surfaced by [`crate::RpcClient::stats`].
#[derive(Debug, Clone, Copy)]
pub struct RpcStats {
    /// Calls per command code; slot 0 counts unknown commands.
    pub calls: [u64; LAST_COMMAND + 1],
    /// Allocation reused a free channel bound to the same server.
    pub chan_hits: u64,
    /// Allocation took a never-used channel.
    pub chan_new: u64,
    /// Allocation stole a free channel from another server.
    pub chan_reuse: u64,
    /// Allocation had to wait for a free channel.
    pub chan_waits: u64,
    /// Wakeup broadcasts on the zero-to-nonzero free transition.
    pub chan_broadcasts: u64,
    /// Explicit acks sent in answer to unsolicited closes.
    pub closes: u64,
    /// NACK replies observed.
    pub nacks: u64,
    /// Fragments rejected after the reply was already complete.
    pub dup_frag_drops: u64,
}

impl Default for RpcStats {
    fn default() -> Self {
        Self {
            calls: [0; LAST_COMMAND + 1],
            chan_hits: 0,
            chan_new: 0,
            chan_reuse: 0,
            chan_waits: 0,
            chan_broadcasts: 0,
            closes: 0,
            nacks: 0,
            dup_frag_drops: 0,
        }
    }
}

pub(crate) enum TryAlloc {
    Got(usize),
    /// No channel can be handed out right now; wait for a release.
    Wait,
}

pub(crate) struct Pool {
    pub slots: Vec<ChannelSlot>,
    pub free_count: usize,
    pub congestion: CongestionMap,
    pub stats: RpcStats,
}

impl Pool {
    pub(crate) fn new(num_channels: usize) -> Self {
        let slots: Vec<ChannelSlot> = (0..num_channels)
            .map(|_| ChannelSlot {
                state: ChanState::Free,
                server: None,
                server_hint: 0,
                notify: Arc::new(Notify::new()),
                assembly: None,
            })
            .collect();
        Self {
            slots,
            free_count: num_channels,
            congestion: CongestionMap::new(),
            stats: RpcStats::default(),
        }
    }

    /// One allocation attempt under the lock. The policy, in order:
    /// congested servers are limited to their existing channel; then a
    /// free channel cached for this server; then a never-used channel;
    /// then any other free channel; otherwise the caller waits.
    pub(crate) fn try_alloc(&mut self, server: HostId, congestion_interval: Duration) -> TryAlloc {
        if self.congestion.fresh(server, congestion_interval) {
            let mut free_match = None;
            let mut busy_match = false;
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.server == Some(server) {
                    match slot.state {
                        ChanState::Free if free_match.is_none() => free_match = Some(i),
                        ChanState::Busy => busy_match = true,
                        _ => {}
                    }
                }
            }
            if let Some(i) = free_match {
                self.stats.chan_hits += 1;
                return self.take(i, server);
            }
            if busy_match {
                self.stats.chan_waits += 1;
                return TryAlloc::Wait;
            }
            // No channel for this server yet; fall through to the normal
            // scan and create one.
        } else if self.congestion.contains(server) {
            // The congestion mark aged out; the server is okay now.
            self.congestion.clear(server);
        }

        let mut same_server = None;
        let mut first_unused = None;
        let mut first_free = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state != ChanState::Free {
                continue;
            }
            match slot.server {
                Some(id) if id == server => {
                    same_server = Some(i);
                    break;
                }
                None => {
                    if first_unused.is_none() {
                        first_unused = Some(i);
                    }
                }
                Some(_) => {
                    if first_free.is_none() {
                        first_free = Some(i);
                    }
                }
            }
        }
        if let Some(i) = same_server {
            // Reusing the channel gives the server an implicit
            // acknowledgment of the previous transaction.
            self.stats.chan_hits += 1;
            return self.take(i, server);
        }
        if let Some(i) = first_unused {
            self.stats.chan_new += 1;
            return self.take(i, server);
        }
        if let Some(i) = first_free {
            self.stats.chan_reuse += 1;
            return self.take(i, server);
        }
        self.stats.chan_waits += 1;
        TryAlloc::Wait
    }

    fn take(&mut self, index: usize, server: HostId) -> TryAlloc {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, ChanState::Free);
        slot.state = ChanState::Busy;
        slot.server = Some(server);
        self.free_count -= 1;
        TryAlloc::Got(index)
    }

    /// Release a channel. Returns true when this was the zero-to-nonzero
    /// free transition.
    pub(crate) fn release(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        if slot.state == ChanState::Free {
            panic!("releasing a free channel");
        }
        slot.state = ChanState::Free;
        slot.assembly = None;
        self.free_count += 1;
        let broadcast = self.free_count == 1;
        if broadcast {
            self.stats.chan_broadcasts += 1;
        }
        broadcast
    }

    /// Route an inbound reply fragment to its channel. Returns the notify
    /// handle to poke when the fragment advanced the assembly.
    pub(crate) fn ingest_reply(&mut self, frame: &Frame) -> Option<Arc<Notify>> {
        let index = frame.header.channel as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            debug!(component = "RPC", index, "reply for unknown channel");
            return None;
        };
        if slot.state != ChanState::Busy {
            debug!(component = "RPC", index, "reply for idle channel");
            return None;
        }
        let Some(assembly) = slot.assembly.as_mut() else {
            return None;
        };
        match assembly.ingest(frame) {
            Ingest::Completed | Ingest::Progress => {
                slot.server_hint = frame.header.server_hint;
                Some(Arc::clone(&slot.notify))
            }
            Ingest::Dropped(reason) => {
                if reason == "duplicate after completion" {
                    self.stats.dup_frag_drops += 1;
                }
                debug!(component = "RPC", index, reason, "dropped reply fragment");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_proto::frame_flags;

    fn frame(xid: u32, channel: u16, idx: u16, count: u16, offset: u32, payload: &[u8]) -> Frame {
        Frame {
            header: FrameHeader {
                flags: frame_flags::REPLY | frame_flags::SERVER,
                command: 1,
                client_id: 1,
                server_id: 2,
                boot_gen: 5,
                xid,
                channel,
                frag_index: idx,
                frag_count: count,
                status: 0,
                server_hint: 0,
                param_size: 4,
                data_size: 6,
                frag_offset: offset,
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_assembly_single_fragment() {
        let mut a = Assembly::new(9);
        let f = frame(9, 0, 0, 1, 0, b"ppppdddddd");
        assert!(matches!(a.ingest(&f), Ingest::Completed));
        assert!(a.complete);
        let (params, data) = a.into_parts();
        assert_eq!(params, b"pppp");
        assert_eq!(data, b"dddddd");
    }

    #[test]
    fn test_assembly_out_of_order_fragments() {
        let mut a = Assembly::new(9);
        assert!(matches!(
            a.ingest(&frame(9, 0, 1, 2, 6, b"dddd")),
            Ingest::Progress
        ));
        assert!(matches!(
            a.ingest(&frame(9, 0, 0, 2, 0, b"ppppdd")),
            Ingest::Completed
        ));
        let (params, data) = a.into_parts();
        assert_eq!(params, b"pppp");
        assert_eq!(data, b"dddddd");
    }

    #[test]
    fn test_assembly_rejects_duplicates_and_stale() {
        let mut a = Assembly::new(9);
        assert!(matches!(
            a.ingest(&frame(9, 0, 0, 2, 0, b"ppppdd")),
            Ingest::Progress
        ));
        // Same fragment again
        assert!(matches!(
            a.ingest(&frame(9, 0, 0, 2, 0, b"ppppdd")),
            Ingest::Dropped(_)
        ));
        // Wrong transaction
        assert!(matches!(
            a.ingest(&frame(8, 0, 1, 2, 6, b"dddd")),
            Ingest::Dropped(_)
        ));
        // Completion, then a late duplicate
        assert!(matches!(
            a.ingest(&frame(9, 0, 1, 2, 6, b"dddd")),
            Ingest::Completed
        ));
        assert!(matches!(
            a.ingest(&frame(9, 0, 1, 2, 6, b"dddd")),
            Ingest::Dropped("duplicate after completion")
        ));
    }

    #[test]
    fn test_alloc_prefers_cached_server() {
        let mut pool = Pool::new(3);
        // Bind channel 1 to server 7, then free it.
        pool.slots[1].state = ChanState::Busy;
        pool.slots[1].server = Some(7);
        pool.free_count -= 1;
        pool.release(1);

        match pool.try_alloc(7, Duration::from_secs(10)) {
            TryAlloc::Got(i) => assert_eq!(i, 1),
            TryAlloc::Wait => panic!("expected a channel"),
        }
        assert_eq!(pool.stats.chan_hits, 1);
    }

    #[test]
    fn test_alloc_prefers_unused_over_steal() {
        let mut pool = Pool::new(3);
        pool.slots[0].server = Some(5); // used previously, now free
        match pool.try_alloc(7, Duration::from_secs(10)) {
            TryAlloc::Got(i) => assert_eq!(i, 1, "first never-used channel"),
            TryAlloc::Wait => panic!("expected a channel"),
        }
        assert_eq!(pool.stats.chan_new, 1);
    }

    #[test]
    fn test_alloc_steals_when_no_unused() {
        let mut pool = Pool::new(2);
        pool.slots[0].server = Some(5);
        pool.slots[1].server = Some(6);
        match pool.try_alloc(7, Duration::from_secs(10)) {
            TryAlloc::Got(i) => assert_eq!(i, 0),
            TryAlloc::Wait => panic!("expected a channel"),
        }
        assert_eq!(pool.stats.chan_reuse, 1);
        assert_eq!(pool.slots[0].server, Some(7));
    }

    #[test]
    fn test_alloc_waits_when_pool_exhausted() {
        let mut pool = Pool::new(1);
        assert!(matches!(
            pool.try_alloc(7, Duration::from_secs(10)),
            TryAlloc::Got(0)
        ));
        assert!(matches!(
            pool.try_alloc(8, Duration::from_secs(10)),
            TryAlloc::Wait
        ));
        assert_eq!(pool.stats.chan_waits, 1);
    }

    #[test]
    fn test_congested_server_restricted_to_one_channel() {
        let mut pool = Pool::new(4);
        pool.congestion.mark(7);

        // First allocation creates the single channel for the server.
        let TryAlloc::Got(first) = pool.try_alloc(7, Duration::from_secs(10)) else {
            panic!("expected a channel");
        };

        // While that channel is busy, further allocations must wait even
        // though the pool has free channels.
        assert!(matches!(
            pool.try_alloc(7, Duration::from_secs(10)),
            TryAlloc::Wait
        ));

        // Releasing it makes it the one reusable channel.
        pool.release(first);
        match pool.try_alloc(7, Duration::from_secs(10)) {
            TryAlloc::Got(i) => assert_eq!(i, first),
            TryAlloc::Wait => panic!("expected the released channel"),
        }

        // Other servers are unaffected.
        assert!(matches!(
            pool.try_alloc(8, Duration::from_secs(10)),
            TryAlloc::Got(_)
        ));
    }

    #[test]
    fn test_congestion_expires() {
        let mut pool = Pool::new(2);
        pool.congestion.mark(7);
        // A zero interval means every mark is already stale.
        let TryAlloc::Got(a) = pool.try_alloc(7, Duration::ZERO) else {
            panic!("expected a channel");
        };
        let TryAlloc::Got(b) = pool.try_alloc(7, Duration::ZERO) else {
            panic!("expected a second channel");
        };
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "releasing a free channel")]
    fn test_double_release_panics() {
        let mut pool = Pool::new(1);
        pool.release(0);
    }
}
