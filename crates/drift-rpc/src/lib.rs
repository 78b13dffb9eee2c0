//! # drift-rpc
//!
//! The client side of remote procedure calls: a fixed pool of multiplexed
//! channels, request build and send-wait-retry, reply fragment
//! reassembly, negative-acknowledgment back-pressure, and broadcast.
//!
//! A channel caches the last server it talked to; reusing it gives that
//! server an implicit acknowledgment of the previous transaction. The
//! pool therefore prefers a free channel already bound to the target,
//! then a never-used channel, then steals a free channel from another
//! server, and finally waits.
//!
//! Every completed call feeds the peer registry: a reply (even an error
//! reply) proves the server alive; a timeout or unreachable network
//! reports it dead.

mod channel;
mod client;

pub use channel::RpcStats;
pub use client::{ClientProbe, Reply, RpcClient, RpcTuning};

use drift_proto::{Command, HostId, ProtoError, Status};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The network seam. The daemon implements this over a UDP socket; tests
/// wire two clients back to back in memory. Inbound traffic is pushed the
/// other way: the owner of the socket decodes datagrams and hands
/// client-bound frames to [`RpcClient::handle_inbound`].
pub trait Transport: Send + Sync + 'static {
    /// Send one encoded frame toward a host. `BROADCAST_HOST` fans out to
    /// every known peer.
    fn send(&self, dest: HostId, datagram: Vec<u8>) -> BoxFuture<std::io::Result<()>>;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc {command:?} to host {peer} timed out")]
    Timeout { peer: HostId, command: Command },
    #[error("host {peer} unreachable")]
    Unreachable { peer: HostId },
    #[error("host {peer} rpc service disabled")]
    ServiceDisabled { peer: HostId },
    #[error("host {peer} no longer recognizes the handle passed to {command:?}")]
    StaleHandle { peer: HostId, command: Command },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("host {peer} still congested after {attempts} allocation retries")]
    NackRetryExhausted { peer: HostId, attempts: u32 },
    #[error("host {peer} returned status {status}")]
    Server { peer: HostId, status: Status },
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl RpcError {
    /// The error-taxonomy kind for exit codes and wire replies.
    pub fn status(&self) -> Status {
        match self {
            RpcError::Timeout { .. } => Status::Timeout,
            RpcError::Unreachable { .. } => Status::Unreachable,
            RpcError::ServiceDisabled { .. } => Status::ServiceDisabled,
            RpcError::StaleHandle { .. } => Status::StaleHandle,
            RpcError::InvalidArgument(_) => Status::InvalidArgument,
            RpcError::NackRetryExhausted { .. } => Status::NackRetryExhausted,
            RpcError::Server { status, .. } => *status,
            RpcError::Proto(_) => Status::InvalidArgument,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
