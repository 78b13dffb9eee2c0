//! Stream migration end to end: sharing detection, use-count
//! reconciliation, the self short-circuit, rollback, and process-level
//! file state.

use drift_proto::{
    use_flags, FileId, HandleKind, HostId, MigrateReply, MigrationEnvelope, StreamId,
};
use drift_stream::{
    deencapsulate, deencapsulate_process, encapsulate, encapsulate_process, serve_migrate,
    BoxFuture, IoHandleTable, IoServerClient, MigError, MigrationCtx, MigrationHandler, NameInfo,
    PrefixTable, Result, ServerStreamTable, StreamTable,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const ORIGIN: HostId = 2;
const TARGET: HostId = 3;
const IO_SERVER: HostId = 7;

fn handle_id() -> FileId {
    FileId {
        server: IO_SERVER,
        kind: HandleKind::RemoteFile,
        major: 10,
        minor: 20,
    }
}

fn root_id() -> FileId {
    FileId {
        server: IO_SERVER,
        kind: HandleKind::RemoteFile,
        major: 0,
        minor: 1,
    }
}

/// I/O server embedded in the test: answers migrate notifications by
/// running the real server-side path against in-memory tables.
struct LocalIoServer {
    handles: Arc<IoHandleTable>,
    server_streams: Arc<ServerStreamTable>,
    dst: HostId,
    calls: AtomicU32,
}

impl LocalIoServer {
    fn new(handles: Arc<IoHandleTable>, server_streams: Arc<ServerStreamTable>, dst: HostId) -> Arc<Self> {
        Arc::new(Self {
            handles,
            server_streams,
            dst,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IoServerClient for LocalIoServer {
    fn migrate(&self, envelope: MigrationEnvelope) -> BoxFuture<Result<MigrateReply>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = serve_migrate(&self.handles, &self.server_streams, &envelope, self.dst);
        Box::pin(async move { result })
    }
}

struct TestPrefixes {
    roots: HashMap<FileId, String>,
    opened: Mutex<Vec<String>>,
    fail_open: bool,
}

impl TestPrefixes {
    fn new() -> Arc<Self> {
        let mut roots = HashMap::new();
        roots.insert(root_id(), "/data".to_string());
        Arc::new(Self {
            roots,
            opened: Mutex::new(Vec::new()),
            fail_open: false,
        })
    }
}

impl PrefixTable for TestPrefixes {
    fn prefix_for_root(&self, root: &FileId) -> Option<String> {
        self.roots.get(root).cloned()
    }

    fn open_prefix(&self, prefix: &str) -> BoxFuture<Result<()>> {
        self.opened.lock().unwrap().push(prefix.to_string());
        let fail = self.fail_open;
        let root = root_id();
        Box::pin(async move {
            if fail {
                Err(MigError::PrefixUnavailable(root))
            } else {
                Ok(())
            }
        })
    }
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicU32,
}

impl MigrationHandler for CountingHandler {
    fn mig_end(&self, _envelope: &MigrationEnvelope, _blob: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestBed {
    origin: Arc<StreamTable>,
    target: Arc<StreamTable>,
    handles: Arc<IoHandleTable>,
    server_streams: Arc<ServerStreamTable>,
    io_server: Arc<LocalIoServer>,
    handler: Arc<CountingHandler>,
    ctx: MigrationCtx,
}

/// Origin host 2 holding one stream against the handle, with
/// `origin_refs` stream references recorded at the server.
fn testbed(origin_refs: u32, flags: u32) -> (TestBed, StreamId) {
    let origin = Arc::new(StreamTable::new(ORIGIN));
    let target = Arc::new(StreamTable::new(TARGET));
    let handles = Arc::new(IoHandleTable::new());
    let server_streams = Arc::new(ServerStreamTable::new());

    handles.open(handle_id(), ORIGIN, flags);

    let stream_id = origin.create(
        handle_id(),
        flags,
        100,
        Some(NameInfo {
            file: handle_id(),
            root: root_id(),
            prefix: Some("/data".to_string()),
        }),
    );
    server_streams.open(stream_id, ORIGIN, origin_refs);

    let io_server = LocalIoServer::new(handles.clone(), server_streams.clone(), TARGET);
    let handler = Arc::new(CountingHandler::default());
    let mut ctx = MigrationCtx::new(
        target.clone(),
        io_server.clone(),
        TestPrefixes::new(),
    );
    ctx.register_handler(HandleKind::RemoteFile, handler.clone());

    (
        TestBed {
            origin,
            target,
            handles,
            server_streams,
            io_server,
            handler,
            ctx,
        },
        stream_id,
    )
}

#[tokio::test]
async fn migration_without_close_becomes_shared() {
    // Origin keeps a reference behind: two stream refs recorded at the
    // server, one migrates.
    let (bed, stream_id) = testbed(2, use_flags::READ);

    let envelope = encapsulate(&bed.origin, &stream_id).unwrap();
    assert_eq!(envelope.offset, 100);
    assert_eq!(envelope.src_client, ORIGIN);
    assert_eq!(envelope.flags & use_flags::NEW_STREAM, 0);

    let restored = deencapsulate(&bed.ctx, envelope).await.unwrap();
    assert_eq!(restored, stream_id);

    // Post-state at the I/O server: one more referencing stream, and the
    // origin still on the client list next to the target.
    let handle = bed.handles.get(&handle_id()).unwrap();
    assert_eq!(handle.use_counts.refs, 2);
    assert_eq!(handle.use_counts.write, 0);
    assert_eq!(handle.use_counts.exec, 0);
    assert_eq!(handle.clients, vec![ORIGIN, TARGET]);

    // Post-state at the target: shared flag set, offset carried over.
    let stream = bed.target.get(&stream_id).unwrap();
    assert_ne!(stream.flags & use_flags::REMOTE_SHARED, 0);
    assert_eq!(stream.flags & use_flags::NEW_STREAM, 0);
    assert_eq!(stream.offset, 100);

    assert_eq!(bed.handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sole_reference_migration_is_a_pure_move() {
    let (bed, stream_id) = testbed(1, use_flags::READ | use_flags::WRITE);

    let envelope = encapsulate(&bed.origin, &stream_id).unwrap();
    deencapsulate(&bed.ctx, envelope).await.unwrap();

    let handle = bed.handles.get(&handle_id()).unwrap();
    assert_eq!(handle.use_counts.refs, 1, "pure move leaves counts alone");
    assert_eq!(handle.use_counts.write, 1);
    // Origin closed its last reference: it left the client list.
    assert_eq!(handle.clients, vec![TARGET]);

    let stream = bed.target.get(&stream_id).unwrap();
    assert_eq!(stream.flags & use_flags::REMOTE_SHARED, 0);
}

#[tokio::test]
async fn second_migrating_reference_skips_mig_end() {
    let (bed, stream_id) = testbed(2, use_flags::READ);

    let env1 = encapsulate(&bed.origin, &stream_id).unwrap();
    deencapsulate(&bed.ctx, env1).await.unwrap();
    assert_eq!(bed.handler.calls.load(Ordering::SeqCst), 1);

    // The remaining origin reference follows.
    let env2 = encapsulate(&bed.origin, &stream_id).unwrap();
    deencapsulate(&bed.ctx, env2).await.unwrap();

    // The target already had the stream: no second materialization, and
    // the handle sharing collapsed back to one host.
    assert_eq!(bed.handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(bed.target.get(&stream_id).unwrap().refs, 2);
    let handle = bed.handles.get(&handle_id()).unwrap();
    assert_eq!(handle.clients, vec![TARGET]);
    assert_eq!(bed.server_streams.refs_of(&stream_id, ORIGIN), 0);
    assert_eq!(bed.server_streams.refs_of(&stream_id, TARGET), 2);
}

#[tokio::test]
async fn migration_to_self_short_circuits() {
    // A context living on the origin host itself.
    let origin = Arc::new(StreamTable::new(ORIGIN));
    let handles = Arc::new(IoHandleTable::new());
    let server_streams = Arc::new(ServerStreamTable::new());
    let io_server = LocalIoServer::new(handles, server_streams, ORIGIN);
    let ctx = MigrationCtx::new(origin.clone(), io_server.clone(), TestPrefixes::new());

    let stream_id = origin.create(handle_id(), use_flags::READ, 512, None);
    let envelope = encapsulate(&origin, &stream_id).unwrap();

    let restored = deencapsulate(&ctx, envelope).await.unwrap();
    assert_eq!(restored, stream_id);
    assert_eq!(origin.get(&stream_id).unwrap().offset, 512);
    assert_eq!(origin.get(&stream_id).unwrap().refs, 1, "no new reference");
    assert_eq!(io_server.call_count(), 0, "no rpc for a self migration");
}

#[tokio::test]
async fn encapsulate_is_repeatable() {
    let (bed, stream_id) = testbed(1, use_flags::READ);
    let a = encapsulate(&bed.origin, &stream_id).unwrap();
    let b = encapsulate(&bed.origin, &stream_id).unwrap();
    assert_eq!(a, b);
    assert_eq!(bed.origin.get(&stream_id).unwrap().refs, 1);
}

#[tokio::test]
async fn stale_handle_rolls_back_target_stream() {
    let (bed, stream_id) = testbed(1, use_flags::READ);

    // The server forgets the origin ever had the handle open.
    let handles = Arc::new(IoHandleTable::new());
    let io_server = LocalIoServer::new(handles, bed.server_streams.clone(), TARGET);
    let mut ctx = MigrationCtx::new(bed.target.clone(), io_server, TestPrefixes::new());
    ctx.register_handler(HandleKind::RemoteFile, bed.handler.clone());

    let envelope = encapsulate(&bed.origin, &stream_id).unwrap();
    let err = deencapsulate(&ctx, envelope).await.unwrap_err();
    assert!(matches!(err, MigError::StaleHandle(..)));

    // The half-created target stream was destroyed again.
    assert!(bed.target.get(&stream_id).is_none());
    assert_eq!(bed.handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn name_info_is_reconstituted_with_prefix() {
    let (bed, stream_id) = testbed(2, use_flags::READ);

    let envelope = encapsulate(&bed.origin, &stream_id).unwrap();
    deencapsulate(&bed.ctx, envelope).await.unwrap();

    let name = bed.target.get(&stream_id).unwrap().name.unwrap();
    assert_eq!(name.prefix.as_deref(), Some("/data"));
    // The name server is not this host: the remote flavor sticks.
    assert_eq!(name.file.kind, HandleKind::RemoteFile);
}

#[tokio::test]
async fn process_state_restores_cwd_and_slots() {
    let (bed, cwd_id) = testbed(2, use_flags::READ);

    // A second open file on its own handle.
    let file_handle = FileId {
        server: IO_SERVER,
        kind: HandleKind::RemoteFile,
        major: 11,
        minor: 21,
    };
    bed.handles.open(file_handle, ORIGIN, use_flags::READ);
    let file_stream = bed.origin.create(file_handle, use_flags::READ, 7, None);
    bed.server_streams.open(file_stream, ORIGIN, 1);

    let state = encapsulate_process(
        &bed.origin,
        vec![100, 200],
        0o022,
        vec![0, 1, 0],
        &cwd_id,
        &[Some(file_stream), None, Some(cwd_id)],
    )
    .unwrap();
    assert_eq!(state.cwd_prefix, "/data");
    assert_eq!(state.slots.len(), 3);
    assert!(state.slots[1].is_none());

    let prefixes = TestPrefixes::new();
    let mut ctx = MigrationCtx::new(bed.target.clone(), bed.io_server.clone(), prefixes.clone());
    ctx.register_handler(HandleKind::RemoteFile, bed.handler.clone());

    let (cwd, slots) = deencapsulate_process(&ctx, state).await.unwrap();
    assert_eq!(cwd, cwd_id);
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0], Some(file_stream));
    assert_eq!(slots[1], None);
    assert_eq!(slots[2], Some(cwd_id));

    // The prefix was re-opened before any stream was restored.
    assert_eq!(prefixes.opened.lock().unwrap().as_slice(), ["/data"]);
}

#[tokio::test]
async fn process_restore_fails_when_prefix_unavailable() {
    let (bed, cwd_id) = testbed(1, use_flags::READ);

    let state = encapsulate_process(&bed.origin, vec![], 0o022, vec![], &cwd_id, &[]).unwrap();

    let prefixes = Arc::new(TestPrefixes {
        roots: HashMap::new(),
        opened: Mutex::new(Vec::new()),
        fail_open: true,
    });
    let ctx = MigrationCtx::new(bed.target.clone(), bed.io_server.clone(), prefixes);

    let err = deencapsulate_process(&ctx, state).await.unwrap_err();
    assert!(matches!(err, MigError::PrefixUnavailable(_)));
    assert!(bed.target.is_empty(), "nothing may survive a failed restore");
}
