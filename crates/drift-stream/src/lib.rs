//! # drift-stream
//!
//! Migratable open streams. Moving an open stream between hosts is a
//! three-party protocol: the **origin** packages the stream's essential
//! state into an envelope ([`encapsulate`]), the **target** reconstitutes
//! it ([`deencapsulate`]), and the **I/O server** - the authoritative
//! holder of the underlying I/O handle - shuffles per-client use counts
//! ([`IoHandleTable::reconcile`]) so that closes keep balancing opens no
//! matter how often the stream moves.
//!
//! Book-keeping deliberately happens on the target and server, not the
//! origin: encapsulation is side-effect free so an aborted migration can
//! be backed out by simply deencapsulating at home.

mod handle;
mod migrate;
mod process;
mod stream;

pub use handle::{
    serve_migrate, IoHandle, IoHandleTable, MigrateDecision, ServerStreamTable, UseCounts,
};
pub use migrate::{deencapsulate, encapsulate, MigrationCtx, RpcIoServerClient};
pub use process::{encapsulate_process, deencapsulate_process, ProcessFileState, StreamSlot};
pub use stream::{NameInfo, Stream, StreamTable};

use drift_proto::{FileId, HandleKind, HostId, MigrateReply, MigrationEnvelope, Status};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[derive(Debug, Error)]
pub enum MigError {
    #[error("stream not found")]
    NoSuchStream,
    #[error("i/o server no longer recognizes handle {major}.{minor} for client {client}",
            major = .0.major, minor = .0.minor, client = .1)]
    StaleHandle(FileId, HostId),
    #[error("no migration handler registered for {0:?}")]
    NoHandler(HandleKind),
    #[error("prefix for root {0:?} is not installed")]
    PrefixUnavailable(FileId),
    #[error("migration state inconsistent: {0}")]
    Inconsistency(String),
    #[error("rpc: {0}")]
    Rpc(#[from] drift_rpc::RpcError),
    #[error("codec: {0}")]
    Codec(#[from] drift_proto::ProtoError),
}

impl MigError {
    pub fn status(&self) -> Status {
        match self {
            MigError::NoSuchStream => Status::NoSuchFile,
            MigError::StaleHandle(..) => Status::StaleHandle,
            MigError::NoHandler(_) => Status::InvalidArgument,
            MigError::PrefixUnavailable(_) => Status::DomainUnavailable,
            MigError::Inconsistency(_) => Status::Inconsistency,
            MigError::Rpc(e) => e.status(),
            MigError::Codec(_) => Status::InvalidArgument,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigError>;

/// Per-kind hook run on the target when the first reference to a stream
/// arrives: materialize the local I/O handle from the server's opaque
/// blob.
pub trait MigrationHandler: Send + Sync {
    fn mig_end(&self, envelope: &MigrationEnvelope, blob: &[u8]) -> Result<()>;
}

/// The target's way of telling the I/O server that a stream client moved.
/// Production routes this through the RPC client; tests call the handle
/// table directly.
pub trait IoServerClient: Send + Sync {
    fn migrate(&self, envelope: MigrationEnvelope) -> BoxFuture<Result<MigrateReply>>;
}

/// Prefix bookkeeping seam: maps a root file ID back to its mounted
/// prefix, and installs a prefix by name (an open call) when a migrated
/// process brings its working directory along.
pub trait PrefixTable: Send + Sync {
    fn prefix_for_root(&self, root: &FileId) -> Option<String>;
    fn open_prefix(&self, prefix: &str) -> BoxFuture<Result<()>>;
}
