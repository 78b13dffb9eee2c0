//! # drift-recov
//!
//! Up/down state about other hosts. Recovery actions registered with
//! [`PeerRegistry::register_callback`] are called back when a peer crashes
//! and when it reboots. Regular message traffic plus explicit pings
//! determine the state of other hosts: the RPC layer calls
//! [`PeerRegistry::note_alive`] when a message arrives and
//! [`PeerRegistry::note_dead`] when a transaction times out.
//! [`PeerRegistry::is_dead`] queries the state of another host, and
//! [`PeerRegistry::wait_for`] parks a task until a host comes back.
//!
//! A synchronization hook is provided by `note_alive`: a synchronous
//! caller is blocked while crash recovery actions for that peer are in
//! progress.

mod pinger;
mod registry;
mod trace;

pub use pinger::run_pinger;
pub use registry::{PeerRegistry, RecovStats, RegistryTuning};
pub use trace::{TraceCause, TraceRecord};

use drift_proto::{BootGen, HostId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Per-peer liveness as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// We have never exchanged a message with this peer.
    Unknown,
    Alive,
    Dead,
}

/// Answer from [`PeerRegistry::is_dead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Down,
    /// The peer answered but its RPC service is not taking requests yet
    /// (still booting).
    ServiceDisabled,
}

/// Whether `note_alive` should block the caller until a pending crash
/// callback phase for the peer completes.
///
/// Servers want synchronous recovery so they do not service a rebooted
/// client until state associated with it has been cleaned up; clients let
/// the crash callbacks finish in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Synchronous,
    Asynchronous,
}

/// When a registered callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// Peer declared down after an RPC timeout.
    Down,
    /// Peer detected up again with a new boot generation.
    Reboot,
    /// Both of the above. Callbacks are still invoked with `Down` or
    /// `Reboot`, never `Both`.
    Both,
}

impl When {
    pub(crate) fn matches(self, event: When) -> bool {
        self == event || self == When::Both
    }
}

/// A recovery action. Invoked on the runtime's worker threads; must be
/// quick and idempotent. A returned error is logged and swallowed so one
/// registrant can never block future callbacks.
pub trait RecoveryCallback: Send + Sync {
    fn on_event(
        &self,
        peer: HostId,
        when: When,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> RecoveryCallback for F
where
    F: Fn(HostId, When) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
{
    fn on_event(
        &self,
        peer: HostId,
        when: When,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(peer, when)
    }
}

/// Outcome of one liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The peer answered; its boot generation from the reply header.
    Alive(BootGen),
    Timeout,
    ServiceDisabled,
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The probe seam. The RPC client implements this with the Echo command;
/// tests substitute scripted outcomes. Ping results never change registry
/// state directly - only `note_alive`/`note_dead` do, and a production
/// probe routes through them.
pub trait Probe: Send + Sync + 'static {
    fn ping(&self, peer: HostId) -> BoxFuture<PingOutcome>;
}

/// Result of [`PeerRegistry::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The peer came back.
    Alive,
    /// The registry shut down before the peer came back.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum RecovError {
    #[error("bad host id {0} (broadcast or self)")]
    BadHostId(HostId),
}

pub type Result<T> = std::result::Result<T, RecovError>;
