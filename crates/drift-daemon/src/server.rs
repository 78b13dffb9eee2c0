//! The receive dispatch loop and the service side of the RPC protocol:
//! requests are reassembled, dispatched to a service handler, and
//! answered; client-bound frames go to the RPC client.

use drift_proto::{
    decode_payload, encode_payload, frame_flags, fragment, Command, Frame, FrameHeader, HostId,
    MigrationEnvelope, PrefixAnswer, Status, TimeOfDay, BROADCAST_HOST,
};
use drift_recov::{PeerRegistry, SyncMode};
use drift_rpc::RpcClient;
use drift_stream::{serve_migrate, IoHandleTable, ServerStreamTable};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Shared state for the service side of this host.
pub struct Service {
    pub local_host: HostId,
    pub boot_gen: u32,
    pub registry: Arc<PeerRegistry>,
    pub client: Arc<RpcClient>,
    pub handles: Arc<IoHandleTable>,
    pub server_streams: Arc<ServerStreamTable>,
    /// Prefixes this host serves, for lookup broadcasts.
    pub prefixes: HashMap<String, PrefixAnswer>,
    /// Cleared while the daemon is still initializing; echo probes get a
    /// service-disabled answer so peers hold their recovery actions.
    pub enabled: AtomicBool,
    assemblies: Mutex<HashMap<(HostId, u16), RequestAssembly>>,
}

struct RequestAssembly {
    xid: u32,
    body: Vec<u8>,
    param_total: usize,
    delivered: u32,
    frag_count: u16,
}

impl Service {
    pub fn new(
        local_host: HostId,
        boot_gen: u32,
        registry: Arc<PeerRegistry>,
        client: Arc<RpcClient>,
        handles: Arc<IoHandleTable>,
        server_streams: Arc<ServerStreamTable>,
        prefixes: HashMap<String, PrefixAnswer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_host,
            boot_gen,
            registry,
            client,
            handles,
            server_streams,
            prefixes,
            enabled: AtomicBool::new(false),
            assemblies: Mutex::new(HashMap::new()),
        })
    }

    /// Run the socket receive loop until the registry shuts down.
    pub async fn run(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 2048];
        loop {
            if self.registry.is_shutting_down() {
                return;
            }
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(component = "DAEMON", error = %e, "socket receive failed");
                    continue;
                }
            };
            let frame = match Frame::decode(&buf[..len]) {
                Ok(f) => f,
                Err(e) => {
                    debug!(component = "DAEMON", error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            let flags = frame.header.flags;
            if flags & (frame_flags::REPLY | frame_flags::ACK) != 0
                || (flags & frame_flags::CLOSE != 0 && flags & frame_flags::REQUEST == 0)
            {
                self.client.handle_inbound(frame).await;
            } else {
                self.handle_request(&socket, frame, from).await;
            }
        }
    }

    async fn handle_request(&self, socket: &UdpSocket, frame: Frame, from: SocketAddr) {
        // Every inbound request is a liveness hint. Servers recover
        // synchronously: nothing is serviced for a rebooted client until
        // the crash callbacks have cleaned up its state.
        self.registry
            .note_alive(frame.header.client_id, frame.header.boot_gen, SyncMode::Synchronous)
            .await;

        let Some(body) = self.reassemble(&frame) else {
            return; // more fragments outstanding, or a duplicate
        };
        let header = frame.header;
        let (params, _data) = body;

        let command = Command::from_wire(header.command);
        let reply = if !self.enabled.load(Ordering::SeqCst) {
            Some((Status::ServiceDisabled, Vec::new()))
        } else {
            match command {
                Some(Command::Echo) => Some((Status::Ok, params)),
                Some(Command::GetTime) => self.serve_get_time(),
                Some(Command::PrefixLookup) => self.serve_prefix(&header, &params),
                Some(Command::FsMigrate) => Some(self.serve_migrate(&header, &params)),
                None => {
                    warn!(component = "DAEMON", command = header.command, "unknown rpc command");
                    Some((Status::InvalidArgument, Vec::new()))
                }
            }
        };

        if let Some((status, reply_params)) = reply {
            self.send_reply(socket, &header, from, status, &reply_params)
                .await;
        }
    }

    fn serve_get_time(&self) -> Option<(Status, Vec<u8>)> {
        let unix_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let payload = encode_payload(&TimeOfDay {
            unix_secs,
            boot_gen: self.boot_gen,
        })
        .ok()?;
        Some((Status::Ok, payload))
    }

    /// Answer a prefix lookup when this host serves the prefix. A
    /// broadcast that misses stays silent; a directed miss gets an
    /// explicit no-such-file.
    fn serve_prefix(&self, header: &FrameHeader, params: &[u8]) -> Option<(Status, Vec<u8>)> {
        let wanted: String = match decode_payload(params) {
            Ok(p) => p,
            Err(_) => return Some((Status::InvalidArgument, Vec::new())),
        };
        match self.prefixes.get(&wanted) {
            Some(answer) => {
                let payload = encode_payload(answer).ok()?;
                Some((Status::Ok, payload))
            }
            None if header.server_id == BROADCAST_HOST => None,
            None => Some((Status::NoSuchFile, Vec::new())),
        }
    }

    fn serve_migrate(&self, header: &FrameHeader, params: &[u8]) -> (Status, Vec<u8>) {
        let envelope: MigrationEnvelope = match decode_payload(params) {
            Ok(e) => e,
            Err(_) => return (Status::InvalidArgument, Vec::new()),
        };
        match serve_migrate(
            &self.handles,
            &self.server_streams,
            &envelope,
            header.client_id,
        ) {
            Ok(reply) => match encode_payload(&reply) {
                Ok(payload) => (Status::Ok, payload),
                Err(_) => (Status::Inconsistency, Vec::new()),
            },
            Err(e) => {
                warn!(component = "DAEMON", error = %e, "migrate request failed");
                (e.status(), Vec::new())
            }
        }
    }

    async fn send_reply(
        &self,
        socket: &UdpSocket,
        request: &FrameHeader,
        to: SocketAddr,
        status: Status,
        params: &[u8],
    ) {
        let header = FrameHeader {
            flags: frame_flags::REPLY | frame_flags::SERVER,
            command: request.command,
            client_id: request.client_id,
            server_id: self.local_host,
            boot_gen: self.boot_gen,
            xid: request.xid,
            channel: request.channel,
            frag_index: 0,
            frag_count: 1,
            status: status.to_wire(),
            server_hint: request.server_hint,
            param_size: 0,
            data_size: 0,
            frag_offset: 0,
        };
        let frames = match fragment(header, params, &[]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(component = "DAEMON", error = %e, "reply does not fit the fragment budget");
                return;
            }
        };
        for frame in frames {
            if let Err(e) = socket.send_to(&frame.encode(), to).await {
                debug!(component = "DAEMON", error = %e, "reply send failed");
                return;
            }
        }
    }

    /// Collect request fragments per (client, channel). Returns the
    /// combined params and data once the declared sizes are covered.
    fn reassemble(&self, frame: &Frame) -> Option<(Vec<u8>, Vec<u8>)> {
        let h = &frame.header;
        let total = h.param_size as usize + h.data_size as usize;
        if h.frag_count <= 1 {
            let mut params = frame.payload.clone();
            let data = params.split_off((h.param_size as usize).min(params.len()));
            return Some((params, data));
        }

        let key = (h.client_id, h.channel);
        let mut assemblies = self.assemblies.lock().unwrap();
        let entry = assemblies.entry(key).or_insert_with(|| RequestAssembly {
            xid: h.xid,
            body: vec![0u8; total],
            param_total: h.param_size as usize,
            delivered: 0,
            frag_count: h.frag_count,
        });
        if entry.xid != h.xid {
            // A newer transaction on the channel supersedes the old one.
            *entry = RequestAssembly {
                xid: h.xid,
                body: vec![0u8; total],
                param_total: h.param_size as usize,
                delivered: 0,
                frag_count: h.frag_count,
            };
        }
        let bit = 1u32 << h.frag_index;
        if entry.delivered & bit != 0 {
            return None;
        }
        let start = h.frag_offset as usize;
        let end = start + frame.payload.len();
        if end > entry.body.len() || h.frag_count != entry.frag_count {
            debug!(component = "DAEMON", "dropping inconsistent request fragment");
            return None;
        }
        entry.body[start..end].copy_from_slice(&frame.payload);
        entry.delivered |= bit;
        if entry.delivered.count_ones() == entry.frag_count as u32 {
            let done = assemblies.remove(&key).unwrap();
            let mut params = done.body;
            let data = params.split_off(done.param_total.min(params.len()));
            Some((params, data))
        } else {
            None
        }
    }
}
