//! UDP implementation of the RPC transport seam.

use drift_proto::{HostId, BROADCAST_HOST};
use drift_rpc::{BoxFuture, Transport};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: HashMap<HostId, SocketAddr>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, peers: HashMap<HostId, SocketAddr>) -> Arc<Self> {
        Arc::new(Self { socket, peers })
    }

    pub fn peer_addr(&self, host: HostId) -> Option<SocketAddr> {
        self.peers.get(&host).copied()
    }
}

impl Transport for UdpTransport {
    fn send(&self, dest: HostId, datagram: Vec<u8>) -> BoxFuture<io::Result<()>> {
        let socket = Arc::clone(&self.socket);
        let targets: Vec<SocketAddr> = if dest == BROADCAST_HOST {
            self.peers.values().copied().collect()
        } else {
            match self.peers.get(&dest) {
                Some(addr) => vec![*addr],
                None => {
                    return Box::pin(async move {
                        Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no route to host {dest}"),
                        ))
                    })
                }
            }
        };
        Box::pin(async move {
            for addr in targets {
                socket.send_to(&datagram, addr).await?;
            }
            Ok(())
        })
    }
}
