//! The I/O server's side of migration: authoritative per-handle use
//! counts, client lists, and the reconciliation rules that keep closes
//! balancing opens as streams move between hosts.

use crate::{MigError, Result};
use drift_proto::{use_flags, FileId, HostId, MigrateReply, MigrationEnvelope, StreamId};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// How many distinct client streams on distinct hosts reference a
/// handle, split by access mode. Mutated only through
/// [`IoHandleTable::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UseCounts {
    pub refs: u32,
    pub write: u32,
    pub exec: u32,
}

/// Authoritative server-side record of who has an object open and how.
#[derive(Debug, Clone)]
pub struct IoHandle {
    pub id: FileId,
    pub use_counts: UseCounts,
    pub clients: Vec<HostId>,
}

/// What the server concluded about one migrate notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateDecision {
    pub new_stream: bool,
    pub close_src_client: bool,
}

/// The I/O server's handle table.
pub struct IoHandleTable {
    handles: Mutex<HashMap<FileId, IoHandle>>,
}

impl Default for IoHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IoHandleTable {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Install a handle, seeding its counts from the opening client.
    pub fn open(&self, id: FileId, client: HostId, flags: u32) {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.entry(id).or_insert(IoHandle {
            id,
            use_counts: UseCounts::default(),
            clients: Vec::new(),
        });
        handle.use_counts.refs += 1;
        if flags & use_flags::WRITE != 0 {
            handle.use_counts.write += 1;
        }
        if flags & use_flags::EXECUTE != 0 {
            handle.use_counts.exec += 1;
        }
        if !handle.clients.contains(&client) {
            handle.clients.push(client);
        }
    }

    pub fn get(&self, id: &FileId) -> Option<IoHandle> {
        self.handles.lock().unwrap().get(id).cloned()
    }

    /// The clientVerify step: the migrating client must be known to hold
    /// the handle, otherwise its envelope is stale.
    pub fn verify_client(&self, id: &FileId, client: HostId) -> Result<()> {
        let handles = self.handles.lock().unwrap();
        match handles.get(id) {
            Some(handle) if handle.clients.contains(&client) => Ok(()),
            _ => Err(MigError::StaleHandle(*id, client)),
        }
    }

    /// Apply the use-count delta rules for one migration:
    ///
    /// | new stream | src closed | action |
    /// |---|---|---|
    /// | yes | no  | counts up, handle becomes cross-host shared |
    /// | no  | yes | counts down, handle becomes un-shared |
    /// | yes | yes | pure move of the sole reference |
    /// | no  | no  | reference moved between two existing shares |
    ///
    /// Then the client list: the origin leaves it when it closed its last
    /// reference (the entry must exist; a missing one is logged), and the
    /// target joins it when the stream is new there (idempotent).
    ///
    /// Returns the flags to hand back to the target, with the
    /// shared-across-hosts bit updated.
    pub fn reconcile(
        &self,
        id: &FileId,
        src_client: HostId,
        dst_client: HostId,
        flags: u32,
        decision: MigrateDecision,
    ) -> Result<u32> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles
            .get_mut(id)
            .ok_or(MigError::StaleHandle(*id, src_client))?;

        let new_stream = decision.new_stream;
        let close_src = decision.close_src_client;
        let mut out_flags = flags;

        if new_stream && !close_src {
            // New at the destination and still open at the source: one
            // more client stream references the handle.
            handle.use_counts.refs += 1;
            if flags & use_flags::WRITE != 0 {
                handle.use_counts.write += 1;
            }
            if flags & use_flags::EXECUTE != 0 {
                handle.use_counts.exec += 1;
            }
            out_flags |= use_flags::REMOTE_SHARED;
        } else if !new_stream && close_src {
            // The last reference at the source closed and the
            // destination already had one: the sharing collapses.
            handle.use_counts.refs = handle.use_counts.refs.saturating_sub(1);
            if flags & use_flags::WRITE != 0 {
                handle.use_counts.write = handle.use_counts.write.saturating_sub(1);
            }
            if flags & use_flags::EXECUTE != 0 {
                handle.use_counts.exec = handle.use_counts.exec.saturating_sub(1);
            }
            out_flags &= !use_flags::REMOTE_SHARED;
        }
        // The remaining two cases move a reference without any change
        // visible to the handle's use counts.

        if close_src {
            match handle.clients.iter().position(|c| *c == src_client) {
                Some(pos) => {
                    handle.clients.remove(pos);
                }
                None => warn!(
                    component = "STREAM",
                    ?id,
                    src_client,
                    "migrate: source client missing from handle client list"
                ),
            }
        }
        if new_stream && !handle.clients.contains(&dst_client) {
            handle.clients.push(dst_client);
        }

        Ok(out_flags)
    }
}

/// Server-side record of which hosts hold references to each stream,
/// consulted to decide `close_src_client` when a reference migrates.
pub struct ServerStreamTable {
    streams: Mutex<HashMap<StreamId, HashMap<HostId, u32>>>,
}

impl Default for ServerStreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStreamTable {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Record `count` stream references held by a client host.
    pub fn open(&self, stream: StreamId, client: HostId, count: u32) {
        let mut streams = self.streams.lock().unwrap();
        *streams
            .entry(stream)
            .or_default()
            .entry(client)
            .or_insert(0) += count;
    }

    pub fn refs_of(&self, stream: &StreamId, client: HostId) -> u32 {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|clients| clients.get(&client))
            .copied()
            .unwrap_or(0)
    }

    /// Move one reference from the source to the destination host.
    /// Returns the facts the reconcile step needs: whether the source
    /// dropped its last reference.
    pub fn migrate_ref(
        &self,
        stream: StreamId,
        src_client: HostId,
        dst_client: HostId,
        new_stream: bool,
    ) -> MigrateDecision {
        let mut streams = self.streams.lock().unwrap();
        let clients = streams.entry(stream).or_default();

        let close_src_client = match clients.get_mut(&src_client) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                clients.remove(&src_client);
                true
            }
            None => {
                warn!(
                    component = "STREAM",
                    ?stream,
                    src_client,
                    "migrate: source client unknown to server stream record"
                );
                false
            }
        };
        *clients.entry(dst_client).or_insert(0) += 1;
        MigrateDecision {
            new_stream,
            close_src_client,
        }
    }
}

/// The I/O server's handling of one inbound migrate envelope: verify the
/// origin still holds the handle, move the stream reference, reconcile
/// use counts, and answer with the updated flags and offset. The blob
/// seeds the target's handle materialization; regular files need none.
pub fn serve_migrate(
    handles: &IoHandleTable,
    server_streams: &ServerStreamTable,
    envelope: &MigrationEnvelope,
    dst_client: HostId,
) -> Result<MigrateReply> {
    handles.verify_client(&envelope.io_id, envelope.src_client)?;

    let new_stream = envelope.flags & use_flags::NEW_STREAM != 0;
    let decision = server_streams.migrate_ref(
        envelope.stream_id,
        envelope.src_client,
        dst_client,
        new_stream,
    );
    let flags = handles.reconcile(
        &envelope.io_id,
        envelope.src_client,
        dst_client,
        envelope.flags,
        decision,
    )?;

    let blob = Vec::new();
    if blob.len() > drift_proto::MIG_BLOB_MAX {
        return Err(MigError::Inconsistency(format!(
            "migrate blob of {} bytes exceeds the reply budget",
            blob.len()
        )));
    }
    Ok(MigrateReply {
        flags: flags & !use_flags::NEW_STREAM,
        offset: envelope.offset,
        blob,
    })
}
