//! Process-level file state: everything a migrating process carries
//! about its open files, packaged for transport.

use crate::migrate::{deencapsulate, encapsulate, MigrationCtx};
use crate::stream::StreamTable;
use crate::{MigError, Result};
use drift_proto::{MigrationEnvelope, StreamId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One open-file slot: the slot index plus the encapsulated stream, or
/// absent for a closed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSlot {
    pub index: u32,
    pub envelope: MigrationEnvelope,
}

/// A process's file state in transit: group IDs, the file-mode mask, the
/// per-stream flag bytes, the working directory (its prefix name plus the
/// encapsulated cwd stream), and the open slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFileState {
    pub groups: Vec<u32>,
    pub permissions: u32,
    pub stream_flags: Vec<u8>,
    pub cwd_prefix: String,
    pub cwd: MigrationEnvelope,
    pub slots: Vec<Option<StreamSlot>>,
}

/// Package a process's streams. `open_slots` holds the slot table as the
/// process sees it: `None` for closed descriptors.
pub fn encapsulate_process(
    streams: &StreamTable,
    groups: Vec<u32>,
    permissions: u32,
    stream_flags: Vec<u8>,
    cwd: &StreamId,
    open_slots: &[Option<StreamId>],
) -> Result<ProcessFileState> {
    let cwd_stream = streams.get(cwd).ok_or(MigError::NoSuchStream)?;
    let cwd_prefix = cwd_stream
        .name
        .as_ref()
        .and_then(|n| n.prefix.clone())
        .ok_or_else(|| {
            MigError::Inconsistency("no prefix for the working directory".to_string())
        })?;

    let mut slots = Vec::with_capacity(open_slots.len());
    for (index, slot) in open_slots.iter().enumerate() {
        match slot {
            Some(id) => slots.push(Some(StreamSlot {
                index: index as u32,
                envelope: encapsulate(streams, id)?,
            })),
            None => slots.push(None),
        }
    }

    Ok(ProcessFileState {
        groups,
        permissions,
        stream_flags,
        cwd_prefix,
        cwd: encapsulate(streams, cwd)?,
        slots,
    })
}

/// Restore a transported process's file state on this host. The working
/// directory's prefix is re-resolved with an open call first, so the
/// prefix is installed before any stream is restored. A failure part-way
/// releases every stream restored so far.
pub async fn deencapsulate_process(
    ctx: &MigrationCtx,
    state: ProcessFileState,
) -> Result<(StreamId, Vec<Option<StreamId>>)> {
    ctx.prefixes.open_prefix(&state.cwd_prefix).await?;

    let mut restored: Vec<StreamId> = Vec::new();
    let local = ctx.streams.local_host();

    let result = async {
        let cwd = deencapsulate(ctx, state.cwd.clone()).await?;
        restored.push(cwd);

        let mut slots: Vec<Option<StreamId>> = vec![None; state.slots.len()];
        for entry in state.slots.iter().flatten() {
            let id = deencapsulate(ctx, entry.envelope.clone()).await?;
            restored.push(id);
            let index = entry.index as usize;
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(id);
        }
        Ok((cwd, slots))
    }
    .await;

    if let Err(e) = &result {
        warn!(component = "STREAM", error = %e, "process file restore failed, backing out");
        for id in restored {
            ctx.streams.release(&id, local, true);
        }
    }
    result
}
