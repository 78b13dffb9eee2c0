//! Top-level client call path: request build, the send-wait-retry loop,
//! back-pressure handling, and the registry side effects.

use crate::channel::{Assembly, ChanState, Pool, RpcStats, TryAlloc};
use crate::{RpcError, Result, Transport};
use drift_config::RouteProfile;
use drift_proto::{
    frame_flags, fragment, BootGen, Command, Frame, FrameHeader, HostId, Status, BROADCAST_HOST,
    LAST_COMMAND,
};
use drift_recov::{PeerRegistry, PingOutcome, Probe, SyncMode};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tunables read once at client construction.
#[derive(Debug, Clone)]
pub struct RpcTuning {
    pub local_host: HostId,
    pub num_channels: usize,
    pub congestion_interval: Duration,
    pub nack_retry_cap: u32,
    pub lan: RouteProfile,
    pub wan: RouteProfile,
    /// Peers reached over a routed path; everything else uses the LAN
    /// profile.
    pub wan_peers: HashSet<HostId>,
}

impl RpcTuning {
    pub fn from_config(cfg: &drift_config::Config) -> Self {
        Self {
            local_host: cfg.node.host_id,
            num_channels: cfg.rpc.num_channels,
            congestion_interval: cfg.rpc.congestion_interval(),
            nack_retry_cap: cfg.rpc.nack_retry_cap,
            lan: cfg.rpc.lan,
            wan: cfg.rpc.wan,
            wan_peers: cfg
                .node
                .peers
                .iter()
                .filter(|p| p.wan)
                .map(|p| p.id)
                .collect(),
        }
    }
}

/// A completed call: the reply's parameter and data areas plus the
/// server's boot generation from the reply header.
#[derive(Debug, Clone)]
pub struct Reply {
    pub params: Vec<u8>,
    pub data: Vec<u8>,
    pub boot_gen: BootGen,
    pub server: HostId,
}

/// The RPC client. One per process, shared behind `Arc`; every call
/// borrows a channel from the fixed pool for its duration.
pub struct RpcClient {
    tuning: RpcTuning,
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    /// Our own boot generation; latched once at startup and advertised in
    /// every request header so servers can detect our reboots.
    boot_gen: BootGen,
    xid: AtomicU32,
    pool: Mutex<Pool>,
    free_channels: Notify,
}

impl RpcClient {
    pub fn new(
        tuning: RpcTuning,
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        boot_gen: BootGen,
    ) -> Arc<Self> {
        let num_channels = tuning.num_channels;
        Arc::new(Self {
            tuning,
            transport,
            registry,
            boot_gen,
            xid: AtomicU32::new(1),
            pool: Mutex::new(Pool::new(num_channels)),
            free_channels: Notify::new(),
        })
    }

    pub fn stats(&self) -> RpcStats {
        self.pool.lock().unwrap().stats
    }

    pub fn boot_gen(&self) -> BootGen {
        self.boot_gen
    }

    /// Make a remote procedure call. Parameter and data areas travel and
    /// return separately, the way storage callers want them.
    ///
    /// The special server [`BROADCAST_HOST`] broadcasts; the first reply
    /// wins, later replies are dropped, and broadcasts are never retried.
    pub async fn call(
        &self,
        server: HostId,
        command: Command,
        params: &[u8],
        data: &[u8],
    ) -> Result<Reply> {
        let broadcast = server == BROADCAST_HOST;
        if server == self.tuning.local_host {
            return Err(RpcError::InvalidArgument(format!(
                "rpc {command:?} to self (host {server})"
            )));
        }
        if broadcast && !command.broadcast_legal() {
            return Err(RpcError::InvalidArgument(format!(
                "{command:?} may not be broadcast"
            )));
        }
        self.count_call(command);

        let mut nack_attempts = 0u32;
        loop {
            let chan = self.alloc_channel(server).await;
            let outcome = self
                .issue_on_channel(chan, server, command, params, data, broadcast)
                .await;
            self.free_channel(chan);

            if broadcast {
                // Broadcast replies carry generations from whichever host
                // answered; they feed no per-peer tracking.
                return outcome.result;
            }

            match outcome.result {
                Err(RpcError::Server {
                    status: Status::Nack,
                    ..
                }) => {
                    // The server is overloaded: remember that, ramp down
                    // to a single channel, and retry the allocation.
                    self.note_nack(server);
                    nack_attempts += 1;
                    if nack_attempts > self.tuning.nack_retry_cap {
                        let err = RpcError::NackRetryExhausted {
                            peer: server,
                            attempts: nack_attempts - 1,
                        };
                        self.apply_recovery_effects(server, &Err(&err), outcome.boot_gen)
                            .await;
                        return Err(err);
                    }
                    continue;
                }
                result => {
                    self.apply_recovery_effects(server, &result.as_ref(), outcome.boot_gen)
                        .await;
                    return result;
                }
            }
        }
    }

    /// Liveness probe: an Echo exchange. Used by the peer registry's
    /// pinger and reboot gate.
    pub async fn ping(&self, peer: HostId) -> PingOutcome {
        match self.call(peer, Command::Echo, &[], &[]).await {
            Ok(reply) => PingOutcome::Alive(reply.boot_gen),
            Err(RpcError::ServiceDisabled { .. }) => PingOutcome::ServiceDisabled,
            Err(_) => PingOutcome::Timeout,
        }
    }

    // ========================================================================
    // Channel lifecycle
    // ========================================================================

    async fn alloc_channel(&self, server: HostId) -> usize {
        loop {
            let notified = self.free_channels.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut pool = self.pool.lock().unwrap();
                if let TryAlloc::Got(index) =
                    pool.try_alloc(server, self.tuning.congestion_interval)
                {
                    return index;
                }
            }
            notified.await;
        }
    }

    fn free_channel(&self, index: usize) {
        let mut pool = self.pool.lock().unwrap();
        pool.release(index);
        drop(pool);
        // Waiters re-scan on every release: a congested caller may be
        // waiting for this specific channel even when others are free.
        self.free_channels.notify_waiters();
    }

    fn note_nack(&self, server: HostId) {
        let mut pool = self.pool.lock().unwrap();
        pool.stats.nacks += 1;
        pool.congestion.mark(server);
    }

    fn count_call(&self, command: Command) {
        let mut pool = self.pool.lock().unwrap();
        let idx = command as usize;
        if idx <= LAST_COMMAND {
            pool.stats.calls[idx] += 1;
        } else {
            pool.stats.calls[0] += 1;
        }
    }

    // ========================================================================
    // The send-wait-retry loop
    // ========================================================================

    fn profile_for(&self, server: HostId) -> RouteProfile {
        if self.tuning.wan_peers.contains(&server) {
            self.tuning.wan
        } else {
            self.tuning.lan
        }
    }

    /// Build the request header for one transaction on a channel. The
    /// server hint is left over from previous traffic on the channel.
    fn build_header(
        &self,
        chan: usize,
        server: HostId,
        command: Command,
        xid: u32,
        server_hint: u32,
    ) -> FrameHeader {
        let flags = if command == Command::Echo {
            frame_flags::ECHO | frame_flags::SERVER
        } else {
            frame_flags::REQUEST | frame_flags::SERVER
        };
        FrameHeader {
            flags,
            command: command as u16,
            client_id: self.tuning.local_host,
            server_id: server,
            boot_gen: self.boot_gen,
            xid,
            channel: chan as u16,
            frag_index: 0,
            frag_count: 1,
            status: Status::Ok.to_wire(),
            server_hint,
            param_size: 0,
            data_size: 0,
            frag_offset: 0,
        }
    }

    async fn issue_on_channel(
        &self,
        chan: usize,
        server: HostId,
        command: Command,
        params: &[u8],
        data: &[u8],
        broadcast: bool,
    ) -> CallOutcome {
        let xid = self.xid.fetch_add(1, Ordering::Relaxed);
        let profile = self.profile_for(server);

        // Arm the channel for reply reception before anything can arrive.
        let (notify, server_hint) = {
            let mut pool = self.pool.lock().unwrap();
            let slot = &mut pool.slots[chan];
            slot.assembly = Some(Assembly::new(xid));
            (Arc::clone(&slot.notify), slot.server_hint)
        };

        let header = self.build_header(chan, server, command, xid, server_hint);
        let frames = match fragment(header, params, data) {
            Ok(frames) => frames,
            Err(e) => {
                return CallOutcome {
                    result: Err(e.into()),
                    boot_gen: None,
                }
            }
        };

        let retries = if broadcast { 0 } else { profile.max_retries };
        let mut timeout = profile.initial_timeout();

        for attempt in 0..=retries {
            if attempt > 0 {
                debug!(component = "RPC", server, ?command, attempt, "retransmitting");
            }
            if let Err(e) = self.transmit(server, &frames).await {
                return CallOutcome {
                    result: Err(e),
                    boot_gen: None,
                };
            }

            let mut deadline = Instant::now() + timeout;
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.poll_channel(chan, xid, command) {
                    ChannelPoll::Complete(outcome) => return outcome,
                    ChannelPoll::Acked => {
                        // The server saw the request and is working on it;
                        // restart the current wait without burning a retry.
                        deadline = Instant::now() + timeout;
                    }
                    ChannelPoll::Pending => {}
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }

            // Escalate per the transport profile, doubling up to its cap.
            timeout = (timeout * 2).min(profile.max_timeout());
        }

        CallOutcome {
            result: Err(RpcError::Timeout {
                peer: server,
                command,
            }),
            boot_gen: None,
        }
    }

    async fn transmit(&self, server: HostId, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.transport
                .send(server, frame.encode())
                .await
                .map_err(|e| {
                    debug!(component = "RPC", server, error = %e, "send failed");
                    RpcError::Unreachable { peer: server }
                })?;
        }
        Ok(())
    }

    fn poll_channel(&self, chan: usize, xid: u32, command: Command) -> ChannelPoll {
        let mut pool = self.pool.lock().unwrap();
        let slot = &mut pool.slots[chan];
        let Some(assembly) = slot.assembly.as_mut() else {
            return ChannelPoll::Pending;
        };
        if assembly.xid != xid {
            return ChannelPoll::Pending;
        }
        if assembly.complete {
            let assembly = slot.assembly.take().unwrap();
            let boot_gen = assembly.boot_gen;
            let status_raw = assembly.status;
            let server = assembly.responder;
            let (params, data) = assembly.into_parts();
            let result = match Status::from_wire(status_raw) {
                Some(Status::Ok) => Ok(Reply {
                    params,
                    data,
                    boot_gen,
                    server,
                }),
                Some(Status::ServiceDisabled) => Err(RpcError::ServiceDisabled { peer: server }),
                Some(Status::StaleHandle) => Err(RpcError::StaleHandle {
                    peer: server,
                    command,
                }),
                Some(status) => Err(RpcError::Server {
                    peer: server,
                    status,
                }),
                None => Err(RpcError::Server {
                    peer: server,
                    status: Status::Inconsistency,
                }),
            };
            return ChannelPoll::Complete(CallOutcome {
                result,
                boot_gen: Some(boot_gen),
            });
        }
        if assembly.got_ack {
            assembly.got_ack = false;
            return ChannelPoll::Acked;
        }
        ChannelPoll::Pending
    }

    /// Registry side effects of a finished call: a timeout or an
    /// unreachable network is a death hint, anything else proves the
    /// server alive.
    async fn apply_recovery_effects(
        &self,
        server: HostId,
        result: &std::result::Result<&Reply, &RpcError>,
        boot_gen: Option<BootGen>,
    ) {
        let registry = Arc::clone(&self.registry);
        match result {
            Ok(reply) => {
                registry
                    .note_alive(server, reply.boot_gen, SyncMode::Asynchronous)
                    .await;
            }
            Err(RpcError::Timeout { command, .. }) => {
                if *command != Command::Echo {
                    warn!(component = "RPC", server, ?command, "rpc timed out");
                }
                registry.note_dead(server);
            }
            Err(RpcError::Unreachable { .. }) => {
                registry.note_dead(server);
            }
            Err(_) => {
                if let Some(gen) = boot_gen {
                    registry.note_alive(server, gen, SyncMode::Asynchronous).await;
                }
            }
        }
    }

    // ========================================================================
    // Inbound path
    // ========================================================================

    /// Handle a client-bound frame decoded by the transport owner:
    /// replies and acks advance the owning channel, a close on an idle
    /// channel is answered with an explicit ack.
    pub async fn handle_inbound(&self, frame: Frame) {
        let flags = frame.header.flags;
        if flags & frame_flags::CLOSE != 0 && flags & frame_flags::REPLY == 0 {
            self.handle_close(frame).await;
            return;
        }
        if flags & frame_flags::ACK != 0 {
            let notify = {
                let mut pool = self.pool.lock().unwrap();
                let index = frame.header.channel as usize;
                pool.slots.get_mut(index).and_then(|slot| {
                    let assembly = slot.assembly.as_mut()?;
                    if slot.state == ChanState::Busy && assembly.xid == frame.header.xid {
                        assembly.got_ack = true;
                        Some(Arc::clone(&slot.notify))
                    } else {
                        None
                    }
                })
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            return;
        }
        if flags & frame_flags::REPLY != 0 {
            let notify = {
                let mut pool = self.pool.lock().unwrap();
                pool.ingest_reply(&frame)
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
        }
    }

    /// A server asked us to close out its record of our last transaction
    /// on this channel. If the channel is idle, reserve it briefly and
    /// answer with an explicit ack; if it is busy, the in-flight request
    /// is the implicit ack and nothing is sent.
    async fn handle_close(&self, frame: Frame) {
        let index = frame.header.channel as usize;
        {
            let mut pool = self.pool.lock().unwrap();
            let Some(slot) = pool.slots.get_mut(index) else {
                return;
            };
            if slot.state == ChanState::Busy {
                return;
            }
            slot.state = ChanState::Busy;
            pool.free_count -= 1;
            pool.stats.closes += 1;
        }

        let server = frame.header.server_id;
        let ack = FrameHeader {
            flags: frame_flags::ACK | frame_flags::CLOSE | frame_flags::SERVER,
            command: frame.header.command,
            client_id: self.tuning.local_host,
            server_id: server,
            boot_gen: self.boot_gen,
            xid: frame.header.xid,
            channel: frame.header.channel,
            frag_index: 0,
            frag_count: 1,
            status: Status::Ok.to_wire(),
            server_hint: frame.header.server_hint,
            param_size: 0,
            data_size: 0,
            frag_offset: 0,
        };
        let datagram = Frame {
            header: ack,
            payload: Vec::new(),
        }
        .encode();
        if let Err(e) = self.transport.send(server, datagram).await {
            debug!(component = "RPC", server, error = %e, "close ack send failed");
        }

        {
            let mut pool = self.pool.lock().unwrap();
            pool.release(index);
        }
        self.free_channels.notify_waiters();
    }
}

struct CallOutcome {
    result: Result<Reply>,
    /// Boot generation from the reply header, when any reply arrived.
    boot_gen: Option<BootGen>,
}

enum ChannelPoll {
    Complete(CallOutcome),
    Acked,
    Pending,
}

/// Late-bound [`Probe`] implementation over the client, breaking the
/// construction cycle between the registry (which needs a probe) and the
/// client (which needs the registry).
pub struct ClientProbe {
    inner: Mutex<Option<Arc<RpcClient>>>,
}

impl ClientProbe {
    pub fn unbound() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
        })
    }

    pub fn bind(&self, client: Arc<RpcClient>) {
        *self.inner.lock().unwrap() = Some(client);
    }
}

impl Probe for ClientProbe {
    fn ping(&self, peer: HostId) -> drift_recov::BoxFuture<PingOutcome> {
        let client = self.inner.lock().unwrap().clone();
        Box::pin(async move {
            match client {
                Some(client) => client.ping(peer).await,
                None => PingOutcome::Timeout,
            }
        })
    }
}
