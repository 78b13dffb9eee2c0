//! Bounded in-memory ring of host state transitions, kept for
//! understanding recovery behavior after the fact.

use crate::Liveness;
use drift_proto::HostId;
use std::collections::VecDeque;

/// Why a trace record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCause {
    /// First time we were interested in the host.
    Init,
    /// We detected a crash.
    Crash,
    /// We detected a reboot.
    Reboot,
    /// Recovery actions completed.
    Done,
    /// A task parked in `wait_for`.
    Wait,
    /// A task woke in `wait_for`.
    Wakeup,
    /// Background pinger probed the host.
    PingCheck,
    /// `is_dead` probed the host on request.
    PingAsk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub peer: HostId,
    pub liveness: Liveness,
    pub cause: TraceCause,
}

pub(crate) struct TraceRing {
    records: VecDeque<TraceRecord>,
    capacity: usize,
}

impl TraceRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn record(&mut self, peer: HostId, liveness: Liveness, cause: TraceCause) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(TraceRecord {
            peer,
            liveness,
            cause,
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.iter().copied().collect()
    }
}
