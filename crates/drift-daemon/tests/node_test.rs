//! Two real nodes on localhost UDP: echo, broadcast, and a migrate
//! notification travelling the full transport path.

use drift_config::RouteProfile;
use drift_daemon::server::Service;
use drift_daemon::transport::UdpTransport;
use drift_proto::{
    use_flags, Command, FileId, HandleKind, HostId, MigrationEnvelope, PrefixAnswer, StreamId,
    TimeOfDay, BROADCAST_HOST,
};
use drift_recov::{PeerRegistry, RegistryTuning};
use drift_rpc::{ClientProbe, RpcClient, RpcTuning};
use drift_stream::{IoHandleTable, IoServerClient, RpcIoServerClient, ServerStreamTable};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

struct Node {
    host: HostId,
    client: Arc<RpcClient>,
    registry: Arc<PeerRegistry>,
    handles: Arc<IoHandleTable>,
    server_streams: Arc<ServerStreamTable>,
    _dispatch: tokio::task::JoinHandle<()>,
}

fn registry_tuning(host: HostId) -> RegistryTuning {
    RegistryTuning {
        local_host: host,
        ping_interval: Duration::from_secs(30),
        reboot_settle: Duration::from_secs(30),
        recent_traffic: Duration::from_secs(10),
        trace_capacity: 50,
        no_timeouts: false,
    }
}

fn rpc_tuning(host: HostId) -> RpcTuning {
    let profile = RouteProfile {
        initial_timeout_ms: 200,
        max_timeout_ms: 1600,
        max_retries: 5,
    };
    RpcTuning {
        local_host: host,
        num_channels: 8,
        congestion_interval: Duration::from_secs(10),
        nack_retry_cap: 3,
        lan: profile,
        wan: profile,
        wan_peers: Default::default(),
    }
}

/// Bind both sockets first so each node knows the other's address.
async fn two_nodes() -> (Node, Node) {
    let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();
    drop(sock_a);
    drop(sock_b);

    // Rebinding the just-released ports keeps the setup simple; the
    // window for another process to steal them is tiny.
    let a = start_node_at(1, 100, addr_a, HashMap::from([(2, addr_b)])).await;
    let b = start_node_at(2, 200, addr_b, HashMap::from([(1, addr_a)])).await;
    (a, b)
}

async fn start_node_at(
    host: HostId,
    boot_gen: u32,
    bind: SocketAddr,
    peers: HashMap<HostId, SocketAddr>,
) -> Node {
    let socket = Arc::new(UdpSocket::bind(bind).await.unwrap());
    let transport = UdpTransport::new(Arc::clone(&socket), peers);

    let probe = ClientProbe::unbound();
    let registry = PeerRegistry::new(
        registry_tuning(host),
        probe.clone() as Arc<dyn drift_recov::Probe>,
    );
    let client = RpcClient::new(rpc_tuning(host), transport, registry.clone(), boot_gen);
    probe.bind(client.clone());

    let handles = Arc::new(IoHandleTable::new());
    let server_streams = Arc::new(ServerStreamTable::new());
    let service = Service::new(
        host,
        boot_gen,
        registry.clone(),
        client.clone(),
        Arc::clone(&handles),
        Arc::clone(&server_streams),
        HashMap::from([(
            "/data".to_string(),
            PrefixAnswer {
                prefix: "/data".to_string(),
                server: host,
                root: FileId {
                    server: host,
                    kind: HandleKind::LocalFile,
                    major: 0,
                    minor: 0,
                },
            },
        )]),
    );
    service.enabled.store(true, Ordering::SeqCst);
    let dispatch = tokio::spawn(Arc::clone(&service).run(Arc::clone(&socket)));

    Node {
        host,
        client,
        registry,
        handles,
        server_streams,
        _dispatch: dispatch,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_between_real_nodes() {
    let (a, b) = two_nodes().await;

    let reply = a.client.call(2, Command::Echo, b"over the wire", &[]).await.unwrap();
    assert_eq!(reply.params, b"over the wire");
    assert_eq!(reply.boot_gen, 200);

    // Both sides learned about each other: A from the reply, B from the
    // request.
    assert_eq!(
        a.registry.is_dead(2, false).await.unwrap(),
        drift_recov::Availability::Up
    );
    assert_eq!(
        b.registry.is_dead(1, false).await.unwrap(),
        drift_recov::Availability::Up
    );

    a.registry.shutdown();
    b.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn get_time_over_broadcast() {
    let (a, b) = two_nodes().await;

    let reply = a
        .client
        .call(BROADCAST_HOST, Command::GetTime, &[], &[])
        .await
        .unwrap();
    let time: TimeOfDay = drift_proto::decode_payload(&reply.params).unwrap();
    assert_eq!(time.boot_gen, 200);
    assert!(time.unix_secs > 0);

    a.registry.shutdown();
    b.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn prefix_lookup_finds_the_serving_host() {
    let (a, b) = two_nodes().await;

    let wanted = drift_proto::encode_payload(&"/data".to_string()).unwrap();
    let reply = a
        .client
        .call(BROADCAST_HOST, Command::PrefixLookup, &wanted, &[])
        .await
        .unwrap();
    let answer: PrefixAnswer = drift_proto::decode_payload(&reply.params).unwrap();
    assert_eq!(answer.server, 2);
    assert_eq!(answer.prefix, "/data");

    a.registry.shutdown();
    b.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn migrate_notification_crosses_the_wire() {
    let (a, b) = two_nodes().await;
    assert_eq!(a.host, 1);

    // Host 3 (the origin) holds the stream and the handle at B.
    let io_id = FileId {
        server: 2,
        kind: HandleKind::LocalFile,
        major: 5,
        minor: 6,
    };
    let stream_id = StreamId {
        origin: 3,
        serial: 1,
    };
    b.handles.open(io_id, 3, use_flags::READ);
    b.server_streams.open(stream_id, 3, 2);

    let io_client = RpcIoServerClient::new(a.client.clone());
    let reply = io_client
        .migrate(MigrationEnvelope {
            stream_id,
            io_id,
            name: None,
            offset: 4096,
            flags: use_flags::READ | use_flags::NEW_STREAM,
            src_client: 3,
        })
        .await
        .unwrap();

    // The handle became shared between the origin and us.
    assert_ne!(reply.flags & use_flags::REMOTE_SHARED, 0);
    assert_eq!(reply.offset, 4096);
    let handle = b.handles.get(&io_id).unwrap();
    assert_eq!(handle.use_counts.refs, 2);
    assert_eq!(handle.clients, vec![3, 1]);

    a.registry.shutdown();
    b.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn migrate_with_stale_handle_is_rejected() {
    let (a, b) = two_nodes().await;

    let io_id = FileId {
        server: 2,
        kind: HandleKind::LocalFile,
        major: 9,
        minor: 9,
    };
    let io_client = RpcIoServerClient::new(a.client.clone());
    let err = io_client
        .migrate(MigrationEnvelope {
            stream_id: StreamId {
                origin: 3,
                serial: 7,
            },
            io_id,
            name: None,
            offset: 0,
            flags: use_flags::READ | use_flags::NEW_STREAM,
            src_client: 3,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        drift_stream::MigError::Rpc(drift_rpc::RpcError::StaleHandle { .. })
    ));

    a.registry.shutdown();
    b.registry.shutdown();
}
