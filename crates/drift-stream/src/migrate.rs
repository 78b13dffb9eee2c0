//! Encapsulation and deencapsulation of a single stream.

use crate::stream::{NameInfo, StreamTable};
use crate::{IoServerClient, MigError, MigrationHandler, PrefixTable, Result};
use drift_proto::{
    encode_payload, use_flags, Command, HandleKind, MigrateReply, MigrationEnvelope, NameIds,
    StreamId,
};
use drift_rpc::RpcClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the target side of a migration needs: the local stream
/// table, the per-kind handler registry, the I/O server client, and the
/// prefix table.
pub struct MigrationCtx {
    pub streams: Arc<StreamTable>,
    pub io_client: Arc<dyn IoServerClient>,
    pub prefixes: Arc<dyn PrefixTable>,
    handlers: HashMap<HandleKind, Arc<dyn MigrationHandler>>,
}

impl MigrationCtx {
    pub fn new(
        streams: Arc<StreamTable>,
        io_client: Arc<dyn IoServerClient>,
        prefixes: Arc<dyn PrefixTable>,
    ) -> Self {
        Self {
            streams,
            io_client,
            prefixes,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler that materializes local I/O handles for one
    /// object kind.
    pub fn register_handler(&mut self, kind: HandleKind, handler: Arc<dyn MigrationHandler>) {
        self.handlers.insert(kind, handler);
    }

    fn handler(&self, kind: HandleKind) -> Result<&Arc<dyn MigrationHandler>> {
        self.handlers.get(&kind).ok_or(MigError::NoHandler(kind))
    }
}

/// Package a stream's state for migration to another host: stream ID,
/// I/O handle ID, naming IDs, offset, flags and our own host ID.
///
/// Side-effect free with respect to the stream and the I/O handle; the
/// bookkeeping happens later, during deencapsulation, so it can
/// synchronize with close bookkeeping. Calling this twice is harmless,
/// which is what lets an aborted migration back out.
pub fn encapsulate(streams: &StreamTable, id: &StreamId) -> Result<MigrationEnvelope> {
    let stream = streams.get(id).ok_or(MigError::NoSuchStream)?;
    Ok(MigrationEnvelope {
        stream_id: stream.id,
        io_id: stream.io_id,
        name: stream.name.as_ref().map(|n| NameIds {
            file: n.file,
            root: n.root,
        }),
        offset: stream.offset,
        flags: stream.flags,
        src_client: streams.local_host(),
    })
}

/// Reconstitute a stream that was packaged on another host.
///
/// Migration to self short-circuits to a local lookup with no RPC and no
/// observable count changes. Otherwise: reference (or create) the local
/// stream object, rebuild naming state, notify the I/O server, and when
/// this host is seeing the stream for the first time, run the type-tagged
/// handler to materialize the I/O handle from the server's blob. Any
/// failure releases the stream again, destroying it if this host had no
/// prior reference.
pub async fn deencapsulate(ctx: &MigrationCtx, mut envelope: MigrationEnvelope) -> Result<StreamId> {
    let local = ctx.streams.local_host();

    if envelope.src_client == local {
        return match ctx.streams.get(&envelope.stream_id) {
            Some(stream) => Ok(stream.id),
            None => Err(MigError::NoSuchStream),
        };
    }

    let (found_client, found_stream) = ctx.streams.add_client(
        envelope.stream_id,
        local,
        envelope.io_id,
        envelope.flags & !use_flags::NEW_STREAM,
    );
    if !found_client {
        // Extra things happen when the first reference to a stream
        // migrates to this host; the server needs to know.
        envelope.flags |= use_flags::NEW_STREAM;
        ctx.streams
            .with_mut(&envelope.stream_id, |s| s.offset = envelope.offset);
        debug!(component = "STREAM", stream = ?envelope.stream_id, "deencap new stream");
    } else {
        envelope.flags &= !use_flags::NEW_STREAM;
        debug!(component = "STREAM", stream = ?envelope.stream_id, "deencap existing stream");
    }

    if let Some(name_ids) = envelope.name {
        reconstitute_name(ctx, &envelope, &name_ids);
    }

    let result = notify_and_finish(ctx, &envelope, found_client).await;
    match result {
        Ok(()) => Ok(envelope.stream_id),
        Err(e) => {
            ctx.streams
                .release(&envelope.stream_id, local, !found_stream);
            Err(e)
        }
    }
}

/// Rebuild the stream's naming state if it has none yet. File-kind tags
/// flip between their local and remote flavors depending on whether this
/// host serves the name.
fn reconstitute_name(ctx: &MigrationCtx, envelope: &MigrationEnvelope, ids: &NameIds) {
    let local = ctx.streams.local_host();
    ctx.streams.with_mut(&envelope.stream_id, |stream| {
        if stream.name.is_some() {
            return;
        }
        let server_is_self = ids.file.server == local;
        let mut file = ids.file;
        let mut root = ids.root;
        file.kind = file.kind.localized(server_is_self);
        root.kind = root.kind.localized(server_is_self);

        let prefix = ctx.prefixes.prefix_for_root(&root);
        if prefix.is_none() {
            warn!(
                component = "STREAM",
                root = ?root,
                "deencapsulate: no prefix entry for stream root"
            );
        }
        stream.name = Some(NameInfo { file, root, prefix });
    });
}

async fn notify_and_finish(
    ctx: &MigrationCtx,
    envelope: &MigrationEnvelope,
    found_client: bool,
) -> Result<()> {
    // The I/O server checks for cross-network sharing and answers with
    // the flags and offset the target must adopt. NEW_STREAM must not
    // survive into the stored stream flags or it would confuse the
    // reconciliation of later migrations.
    let reply: MigrateReply = ctx.io_client.migrate(envelope.clone()).await?;
    ctx.streams.with_mut(&envelope.stream_id, |stream| {
        stream.flags = reply.flags & !use_flags::NEW_STREAM;
        stream.offset = reply.offset;
    });

    if !found_client {
        let handler = ctx.handler(envelope.io_id.kind)?;
        let mut final_env = envelope.clone();
        final_env.flags = reply.flags;
        handler.mig_end(&final_env, &reply.blob)?;
    }
    Ok(())
}

/// Production [`IoServerClient`]: sends the envelope to the I/O server
/// over the RPC transport.
pub struct RpcIoServerClient {
    client: Arc<RpcClient>,
}

impl RpcIoServerClient {
    pub fn new(client: Arc<RpcClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

impl IoServerClient for RpcIoServerClient {
    fn migrate(&self, envelope: MigrationEnvelope) -> crate::BoxFuture<Result<MigrateReply>> {
        let client = Arc::clone(&self.client);
        Box::pin(async move {
            let params = encode_payload(&envelope)?;
            let reply = client
                .call(envelope.io_id.server, Command::FsMigrate, &params, &[])
                .await?;
            let decoded: MigrateReply = drift_proto::decode_payload(&reply.params)?;
            Ok(decoded)
        })
    }
}
