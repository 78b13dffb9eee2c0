//! Client transport behavior against scripted in-memory servers:
//! roundtrips, fragment reassembly, back-pressure, timeouts, close acks
//! and broadcast.

use drift_config::RouteProfile;
use drift_proto::{
    frame_flags, fragment, Command, Frame, FrameHeader, HostId, Status, BROADCAST_HOST,
};
use drift_recov::{PeerRegistry, PingOutcome, Probe, RegistryTuning};
use drift_rpc::{BoxFuture, RpcClient, RpcError, RpcTuning, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LOCAL: HostId = 1;

struct NeverAnswers;
impl Probe for NeverAnswers {
    fn ping(&self, _peer: HostId) -> drift_recov::BoxFuture<PingOutcome> {
        Box::pin(async { PingOutcome::Timeout })
    }
}

/// How a scripted server answers one request frame.
#[derive(Clone)]
enum Mode {
    /// Reply Ok, echoing the request payload into the reply params.
    Echo { boot_gen: u32 },
    /// Reply Ok with this much data.
    BigReply(usize),
    /// Drop everything on the floor.
    Silent,
    /// Reply with a wire status.
    Reply(Status),
    /// NACK the first request, then switch to the inner mode.
    NackOnce(Box<Mode>),
    /// Count concurrent in-flight requests, then reply Ok after a delay.
    Slow {
        in_flight: Arc<AtomicU32>,
        max_seen: Arc<AtomicU32>,
        delay: Duration,
    },
    /// Send an ACK shortly before the initial timeout would expire, then
    /// the real reply after it would have.
    AckThenReply {
        ack_after: Duration,
        reply_after: Duration,
    },
}

/// In-memory network: one client, any number of scripted servers.
/// Replies are injected straight back into the client's inbound path.
struct FakeNet {
    client: Mutex<Option<Arc<RpcClient>>>,
    servers: Mutex<HashMap<HostId, Mode>>,
    /// Every datagram the client transmitted, for close-ack assertions.
    outbound: Mutex<Vec<Frame>>,
}

impl FakeNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            client: Mutex::new(None),
            servers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Vec::new()),
        })
    }

    fn bind_client(&self, client: Arc<RpcClient>) {
        *self.client.lock().unwrap() = Some(client);
    }

    fn set_server(&self, id: HostId, mode: Mode) {
        self.servers.lock().unwrap().insert(id, mode);
    }

    fn outbound_frames(&self) -> Vec<Frame> {
        self.outbound.lock().unwrap().clone()
    }

    fn reply_header(request: &FrameHeader, server: HostId, status: Status, boot_gen: u32) -> FrameHeader {
        FrameHeader {
            flags: frame_flags::REPLY | frame_flags::SERVER,
            command: request.command,
            client_id: request.client_id,
            server_id: server,
            boot_gen,
            xid: request.xid,
            channel: request.channel,
            frag_index: 0,
            frag_count: 1,
            status: status.to_wire(),
            server_hint: 0,
            param_size: 0,
            data_size: 0,
            frag_offset: 0,
        }
    }

    fn serve(self: &Arc<Self>, server: HostId, mode: Mode, request: Frame) {
        let net = Arc::clone(self);
        tokio::spawn(async move {
            let frames = match mode {
                Mode::Silent => return,
                Mode::Echo { boot_gen } => fragment(
                    Self::reply_header(&request.header, server, Status::Ok, boot_gen),
                    &request.payload,
                    &[],
                )
                .unwrap(),
                Mode::BigReply(n) => fragment(
                    Self::reply_header(&request.header, server, Status::Ok, 5),
                    b"big",
                    &vec![0xabu8; n],
                )
                .unwrap(),
                Mode::Reply(status) => fragment(
                    Self::reply_header(&request.header, server, status, 5),
                    &[],
                    &[],
                )
                .unwrap(),
                Mode::NackOnce(_) => unreachable!("rewritten before dispatch"),
                Mode::Slow {
                    in_flight,
                    max_seen,
                    delay,
                } => {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    fragment(
                        Self::reply_header(&request.header, server, Status::Ok, 5),
                        &[],
                        &[],
                    )
                    .unwrap()
                }
                Mode::AckThenReply {
                    ack_after,
                    reply_after,
                } => {
                    tokio::time::sleep(ack_after).await;
                    let mut ack = Self::reply_header(&request.header, server, Status::Ok, 5);
                    ack.flags = frame_flags::ACK | frame_flags::SERVER;
                    net.deliver(Frame {
                        header: ack,
                        payload: Vec::new(),
                    })
                    .await;
                    tokio::time::sleep(reply_after - ack_after).await;
                    fragment(
                        Self::reply_header(&request.header, server, Status::Ok, 5),
                        b"late",
                        &[],
                    )
                    .unwrap()
                }
            };
            for frame in frames {
                net.deliver(frame).await;
            }
        });
    }

    async fn deliver(&self, frame: Frame) {
        let client = self.client.lock().unwrap().clone();
        if let Some(client) = client {
            client.handle_inbound(frame).await;
        }
    }
}

fn fast_profile() -> RouteProfile {
    RouteProfile {
        initial_timeout_ms: 100,
        max_timeout_ms: 800,
        max_retries: 3,
    }
}

fn tuning() -> RpcTuning {
    RpcTuning {
        local_host: LOCAL,
        num_channels: 8,
        congestion_interval: Duration::from_secs(10),
        nack_retry_cap: 3,
        lan: fast_profile(),
        wan: fast_profile(),
        wan_peers: Default::default(),
    }
}

fn registry() -> Arc<PeerRegistry> {
    PeerRegistry::new(
        RegistryTuning {
            local_host: LOCAL,
            ping_interval: Duration::from_secs(30),
            reboot_settle: Duration::from_secs(30),
            recent_traffic: Duration::from_secs(10),
            trace_capacity: 50,
            no_timeouts: false,
        },
        Arc::new(NeverAnswers),
    )
}

fn setup() -> (Arc<FakeNet>, Arc<RpcClient>, Arc<PeerRegistry>) {
    let net = FakeNet::new();
    let registry = registry();
    let client = RpcClient::new(
        tuning(),
        Arc::new(NetTransport(Arc::clone(&net))),
        registry.clone(),
        99,
    );
    net.bind_client(client.clone());
    (net, client, registry)
}

/// Adapter: routes a sent datagram to the scripted server(s).
struct NetTransport(Arc<FakeNet>);

impl Transport for NetTransport {
    fn send(&self, dest: HostId, datagram: Vec<u8>) -> BoxFuture<std::io::Result<()>> {
        let net = Arc::clone(&self.0);
        Box::pin(async move {
            let frame = Frame::decode(&datagram).expect("client sent a malformed frame");
            net.outbound.lock().unwrap().push(frame.clone());

            let targets: Vec<(HostId, Mode)> = {
                let mut servers = net.servers.lock().unwrap();
                let ids: Vec<HostId> = if dest == BROADCAST_HOST {
                    servers.keys().copied().collect()
                } else {
                    servers.keys().copied().filter(|id| *id == dest).collect()
                };
                ids.into_iter()
                    .map(|id| {
                        let mode = servers.get(&id).unwrap().clone();
                        let dispatched = match mode {
                            Mode::NackOnce(next) => {
                                servers.insert(id, (*next).clone());
                                Mode::Reply(Status::Nack)
                            }
                            m => m,
                        };
                        (id, dispatched)
                    })
                    .collect()
            };

            // Requests get served; acks and other client-to-server
            // control frames are only logged.
            if frame.header.flags & (frame_flags::REQUEST | frame_flags::ECHO) != 0 {
                for (id, mode) in targets {
                    net.serve(id, mode, frame.clone());
                }
            }
            Ok(())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn echo_roundtrip_marks_server_alive() {
    let (net, client, registry) = setup();
    net.set_server(2, Mode::Echo { boot_gen: 7 });

    let reply = client.call(2, Command::Echo, b"hello", &[]).await.unwrap();
    assert_eq!(reply.params, b"hello");
    assert_eq!(reply.boot_gen, 7);
    assert_eq!(reply.server, 2);

    // The reply fed the registry.
    assert!(registry.pending(2) == false);
    assert_eq!(registry.is_dead(2, false).await.unwrap(), drift_recov::Availability::Up);
}

#[tokio::test(start_paused = true)]
async fn large_reply_reassembles_across_fragments() {
    let (net, client, _registry) = setup();
    let size = 5000; // several fragments
    net.set_server(2, Mode::BigReply(size));

    let reply = client.call(2, Command::GetTime, &[], &[]).await.unwrap();
    assert_eq!(reply.params, b"big");
    assert_eq!(reply.data.len(), size);
    assert!(reply.data.iter().all(|b| *b == 0xab));
}

#[tokio::test(start_paused = true)]
async fn timeout_escalates_then_reports_dead() {
    let (net, client, registry) = setup();
    net.set_server(2, Mode::Silent);

    let err = client.call(2, Command::GetTime, &[], &[]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { peer: 2, .. }));

    // Retransmissions happened per the profile (1 initial + 3 retries).
    let sends = net
        .outbound_frames()
        .iter()
        .filter(|f| f.header.flags & frame_flags::REQUEST != 0)
        .count();
    assert_eq!(sends, 4);

    // The timeout was a death hint.
    assert_eq!(
        registry.is_dead(2, false).await.unwrap(),
        drift_recov::Availability::Down
    );
}

#[tokio::test(start_paused = true)]
async fn ack_extends_the_wait_without_a_retry() {
    let (net, client, _registry) = setup();
    // The reply lands at 150ms, past the 100ms initial timeout. The ACK
    // at 80ms restarts the wait, so the first attempt survives and no
    // retransmission happens.
    net.set_server(
        2,
        Mode::AckThenReply {
            ack_after: Duration::from_millis(80),
            reply_after: Duration::from_millis(150),
        },
    );

    let reply = client.call(2, Command::GetTime, &[], &[]).await.unwrap();
    assert_eq!(reply.params, b"late");

    let sends = net
        .outbound_frames()
        .iter()
        .filter(|f| f.header.flags & frame_flags::REQUEST != 0)
        .count();
    assert_eq!(sends, 1, "the ack must suppress retransmission");
}

#[tokio::test(start_paused = true)]
async fn nack_exhausts_bounded_retries() {
    let (net, client, _registry) = setup();
    net.set_server(2, Mode::Reply(Status::Nack));

    let err = client.call(2, Command::GetTime, &[], &[]).await.unwrap_err();
    match err {
        RpcError::NackRetryExhausted { peer, attempts } => {
            assert_eq!(peer, 2);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected NackRetryExhausted, got {other:?}"),
    }
    assert_eq!(client.stats().nacks, 4); // initial attempt + 3 retries
}

#[tokio::test(start_paused = true)]
async fn congested_server_limited_to_one_channel() {
    let (net, client, _registry) = setup();
    let in_flight = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));
    net.set_server(
        2,
        Mode::NackOnce(Box::new(Mode::Slow {
            in_flight: in_flight.clone(),
            max_seen: max_seen.clone(),
            delay: Duration::from_millis(50),
        })),
    );

    // Establish the congestion mark: the first call is NACKed, retried on
    // the ramped-down allocation, and succeeds.
    client.call(2, Command::GetTime, &[], &[]).await.unwrap();
    assert_eq!(client.stats().nacks, 1);

    let mut calls = Vec::new();
    for _ in 0..4 {
        let c = client.clone();
        calls.push(tokio::spawn(async move {
            c.call(2, Command::GetTime, &[], &[]).await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(
        max_seen.load(Ordering::SeqCst),
        1,
        "a congested server must never see parallel requests"
    );
}

#[tokio::test(start_paused = true)]
async fn close_on_idle_channel_answered_with_explicit_ack() {
    let (net, client, _registry) = setup();

    let close = Frame {
        header: FrameHeader {
            flags: frame_flags::CLOSE | frame_flags::SERVER,
            command: Command::GetTime as u16,
            client_id: LOCAL,
            server_id: 2,
            boot_gen: 5,
            xid: 77,
            channel: 3,
            frag_index: 0,
            frag_count: 1,
            status: Status::Ok.to_wire(),
            server_hint: 12,
            param_size: 0,
            data_size: 0,
            frag_offset: 0,
        },
        payload: Vec::new(),
    };
    client.handle_inbound(close).await;

    let acks: Vec<Frame> = net
        .outbound_frames()
        .into_iter()
        .filter(|f| f.header.flags & frame_flags::ACK != 0)
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].header.xid, 77);
    assert_eq!(acks[0].header.server_id, 2);
    assert_eq!(acks[0].header.server_hint, 12);
    assert_eq!(client.stats().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_takes_first_reply_and_ignores_the_rest() {
    let (net, client, _registry) = setup();
    net.set_server(2, Mode::Echo { boot_gen: 2 });
    net.set_server(3, Mode::Echo { boot_gen: 3 });

    let reply = client
        .call(BROADCAST_HOST, Command::GetTime, b"t", &[])
        .await
        .unwrap();
    assert!(reply.server == 2 || reply.server == 3);

    // Let the losing reply drain; it must be dropped silently.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.stats().dup_frag_drops <= 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_of_non_broadcast_command_rejected() {
    let (_net, client, _registry) = setup();
    let err = client
        .call(BROADCAST_HOST, Command::FsMigrate, &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn call_to_self_rejected() {
    let (_net, client, _registry) = setup();
    let err = client.call(LOCAL, Command::GetTime, &[], &[]).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn server_error_status_passes_through() {
    let (net, client, registry) = setup();
    net.set_server(2, Mode::Reply(Status::NoSuchFile));

    let err = client.call(2, Command::PrefixLookup, &[], &[]).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::Server {
            peer: 2,
            status: Status::NoSuchFile
        }
    ));

    // An error reply still proves the server alive.
    assert_eq!(
        registry.is_dead(2, false).await.unwrap(),
        drift_recov::Availability::Up
    );
}
