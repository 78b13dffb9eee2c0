//! # drift-proto
//!
//! Wire-level types shared by the RPC transport and the stream-migration
//! layer: the frame header, command and status codes, and the migration
//! envelope. Payload bodies are bincode; the frame header is a fixed-size
//! hand-laid codec so the dispatch loop can demultiplex a datagram without
//! deserializing the body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire protocol version - bump when making breaking changes.
/// v1: initial protocol (current)
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic number for drift frames: "DR"
pub const FRAME_MAGIC: [u8; 2] = *b"DR";

/// Host identifier. Small integers assigned cluster-wide; zero is reserved
/// for broadcast.
pub type HostId = u32;

/// The broadcast pseudo-host. Only [`Command::PrefixLookup`] and
/// [`Command::GetTime`] may be addressed to it.
pub const BROADCAST_HOST: HostId = 0;

/// Boot generation: monotone per-host incarnation tag. Zero means the host
/// has not yet learned its own generation (early boot) and is never stored.
pub type BootGen = u32;

// ============================================================================
// Transport flags
// ============================================================================

/// Transport flag bits carried in the frame header.
pub mod frame_flags {
    /// Client-to-server request.
    pub const REQUEST: u16 = 0x0001;
    /// Server-to-client reply.
    pub const REPLY: u16 = 0x0002;
    /// Explicit acknowledgment, no payload.
    pub const ACK: u16 = 0x0004;
    /// Server asks the client to close out the last transaction.
    pub const CLOSE: u16 = 0x0008;
    /// Echo probe; handled without dispatching to a service.
    pub const ECHO: u16 = 0x0010;
    /// Set on everything a client sends; distinguishes the two halves of
    /// the protocol when a host acts as both.
    pub const SERVER: u16 = 0x0020;
}

// ============================================================================
// Commands
// ============================================================================

/// RPC command codes. The discriminant is the wire value.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe. Tagged with the ECHO flag instead of REQUEST.
    Echo = 1,
    /// Cluster time of day. Broadcast-legal.
    GetTime = 2,
    /// Resolve a path prefix to its serving host. Broadcast-legal.
    PrefixLookup = 3,
    /// Notify an I/O server that a stream client moved.
    FsMigrate = 4,
}

/// One past the highest command discriminant; sizes the per-command
/// call-count table (slot 0 counts unknown commands).
pub const LAST_COMMAND: usize = 4;

impl Command {
    pub fn from_wire(raw: u16) -> Option<Command> {
        match raw {
            1 => Some(Command::Echo),
            2 => Some(Command::GetTime),
            3 => Some(Command::PrefixLookup),
            4 => Some(Command::FsMigrate),
            _ => None,
        }
    }

    /// Whether this command may be addressed to [`BROADCAST_HOST`].
    pub fn broadcast_legal(self) -> bool {
        matches!(self, Command::PrefixLookup | Command::GetTime)
    }
}

// ============================================================================
// Status codes
// ============================================================================

/// Wire status and error taxonomy. Carried in reply payloads and surfaced
/// as process exit codes by the operator CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Timeout,
    Unreachable,
    ServiceDisabled,
    StaleHandle,
    InvalidArgument,
    NoSuchFile,
    DomainUnavailable,
    NackRetryExhausted,
    Inconsistency,
    OutOfResources,
    /// Negative acknowledgment: the server is overloaded and refused the
    /// request; the client must ramp down channel use.
    Nack,
}

impl Status {
    /// Wire code carried in reply frame headers. Same numbering as the
    /// process exit codes.
    pub fn to_wire(self) -> u16 {
        self.exit_code() as u16
    }

    pub fn from_wire(raw: u16) -> Option<Status> {
        Some(match raw {
            0 => Status::Ok,
            1 => Status::Timeout,
            2 => Status::Unreachable,
            3 => Status::ServiceDisabled,
            4 => Status::StaleHandle,
            5 => Status::InvalidArgument,
            6 => Status::NoSuchFile,
            7 => Status::DomainUnavailable,
            8 => Status::NackRetryExhausted,
            9 => Status::Inconsistency,
            10 => Status::OutOfResources,
            11 => Status::Nack,
            _ => return None,
        })
    }

    /// Process exit code for operator tooling. Zero iff `Ok`.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Timeout => 1,
            Status::Unreachable => 2,
            Status::ServiceDisabled => 3,
            Status::StaleHandle => 4,
            Status::InvalidArgument => 5,
            Status::NoSuchFile => 6,
            Status::DomainUnavailable => 7,
            Status::NackRetryExhausted => 8,
            Status::Inconsistency => 9,
            Status::OutOfResources => 10,
            Status::Nack => 11,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::Timeout => "timeout",
            Status::Unreachable => "unreachable",
            Status::ServiceDisabled => "service-disabled",
            Status::StaleHandle => "stale-handle",
            Status::InvalidArgument => "invalid-argument",
            Status::NoSuchFile => "no-such-file",
            Status::DomainUnavailable => "domain-unavailable",
            Status::NackRetryExhausted => "nack-retry-exhausted",
            Status::Inconsistency => "internal-inconsistency",
            Status::OutOfResources => "out-of-resources",
            Status::Nack => "nack",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Frame header
// ============================================================================

/// Fixed-size frame header (44 bytes), little-endian.
///
/// Wire format:
/// ```text
/// magic(2) ver(1) pad(1) flags(2) command(2)
/// client(4) server(4) boot_gen(4) xid(4)
/// channel(2) frag_index(2) frag_count(2) status(2)
/// server_hint(4) param_size(4) data_size(4) frag_offset(4)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: u16,
    pub command: u16,
    pub client_id: HostId,
    pub server_id: HostId,
    pub boot_gen: BootGen,
    /// Transaction ID; strictly increasing per client process.
    pub xid: u32,
    /// Channel index on the client; echoed by the server so replies can be
    /// demultiplexed without a lookup table.
    pub channel: u16,
    pub frag_index: u16,
    pub frag_count: u16,
    /// Wire status in replies; zero (`Ok`) in requests.
    pub status: u16,
    /// Advisory: last-known server-side handle position for this channel.
    pub server_hint: u32,
    /// Total parameter bytes across all fragments.
    pub param_size: u32,
    /// Total data bytes across all fragments.
    pub data_size: u32,
    /// Byte offset of this fragment's payload in the combined
    /// params-then-data body.
    pub frag_offset: u32,
}

impl FrameHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 44;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&FRAME_MAGIC);
        b[2] = PROTOCOL_VERSION;
        b[3] = 0;
        b[4..6].copy_from_slice(&self.flags.to_le_bytes());
        b[6..8].copy_from_slice(&self.command.to_le_bytes());
        b[8..12].copy_from_slice(&self.client_id.to_le_bytes());
        b[12..16].copy_from_slice(&self.server_id.to_le_bytes());
        b[16..20].copy_from_slice(&self.boot_gen.to_le_bytes());
        b[20..24].copy_from_slice(&self.xid.to_le_bytes());
        b[24..26].copy_from_slice(&self.channel.to_le_bytes());
        b[26..28].copy_from_slice(&self.frag_index.to_le_bytes());
        b[28..30].copy_from_slice(&self.frag_count.to_le_bytes());
        b[30..32].copy_from_slice(&self.status.to_le_bytes());
        b[32..36].copy_from_slice(&self.server_hint.to_le_bytes());
        b[36..40].copy_from_slice(&self.param_size.to_le_bytes());
        b[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Result<FrameHeader> {
        if b[0..2] != FRAME_MAGIC {
            return Err(ProtoError::BadMagic);
        }
        if b[2] != PROTOCOL_VERSION {
            return Err(ProtoError::BadVersion(b[2]));
        }
        Ok(FrameHeader {
            flags: u16::from_le_bytes([b[4], b[5]]),
            command: u16::from_le_bytes([b[6], b[7]]),
            client_id: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            server_id: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
            boot_gen: u32::from_le_bytes([b[16], b[17], b[18], b[19]]),
            xid: u32::from_le_bytes([b[20], b[21], b[22], b[23]]),
            channel: u16::from_le_bytes([b[24], b[25]]),
            frag_index: u16::from_le_bytes([b[26], b[27]]),
            frag_count: u16::from_le_bytes([b[28], b[29]]),
            status: u16::from_le_bytes([b[30], b[31]]),
            server_hint: u32::from_le_bytes([b[32], b[33], b[34], b[35]]),
            param_size: u32::from_le_bytes([b[36], b[37], b[38], b[39]]),
            data_size: u32::from_le_bytes([b[40], b[41], b[42], b[43]]),
            frag_offset: 0,
        })
    }
}

/// A full frame: header plus the raw payload bytes of this fragment. The
/// fragment offset is encoded between the header and the payload on the
/// wire; `FrameHeader::from_bytes` alone leaves it zero.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Largest payload carried by one fragment. Chosen to keep a frame
    /// under a common UDP-safe datagram size.
    pub const MAX_FRAGMENT_PAYLOAD: usize = 1400 - FrameHeader::SIZE - 4;

    /// Upper bound on fragments per message; the reassembly bitmap is a
    /// `u32`.
    pub const MAX_FRAGMENTS: usize = 16;

    /// Encode to one datagram: header, then the fragment offset, then the
    /// payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FrameHeader::SIZE + 4 + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.header.frag_offset.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Frame> {
        if datagram.len() < FrameHeader::SIZE + 4 {
            return Err(ProtoError::Truncated(datagram.len()));
        }
        let mut hdr_bytes = [0u8; FrameHeader::SIZE];
        hdr_bytes.copy_from_slice(&datagram[..FrameHeader::SIZE]);
        let mut header = FrameHeader::from_bytes(&hdr_bytes)?;
        header.frag_offset = u32::from_le_bytes([
            datagram[FrameHeader::SIZE],
            datagram[FrameHeader::SIZE + 1],
            datagram[FrameHeader::SIZE + 2],
            datagram[FrameHeader::SIZE + 3],
        ]);
        Ok(Frame {
            header,
            payload: datagram[FrameHeader::SIZE + 4..].to_vec(),
        })
    }
}

// ============================================================================
// Migration envelope
// ============================================================================

/// Stream use flags. Raw bits so they can travel in headers and envelopes
/// unchanged.
pub mod use_flags {
    pub const READ: u32 = 0x0001;
    pub const WRITE: u32 = 0x0002;
    pub const EXECUTE: u32 = 0x0004;
    /// Transient: set during deencapsulation when the target host sees the
    /// stream for the first time. Never stored on a stream.
    pub const NEW_STREAM: u32 = 0x0100;
    /// The underlying I/O handle is referenced by streams on more than one
    /// host.
    pub const REMOTE_SHARED: u32 = 0x0200;
}

/// Identifies an I/O object cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    /// Host that serves I/O for this object.
    pub server: HostId,
    /// Object kind; selects the migration handler on the receiving host.
    pub kind: HandleKind,
    pub major: u32,
    pub minor: u32,
}

/// I/O handle kinds with distinct migration handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// Regular file served locally on the I/O server.
    LocalFile,
    /// Remote view of a file on another host.
    RemoteFile,
    /// Device stream.
    Device,
    /// Anonymous pipe; carries no name info.
    Pipe,
}

impl HandleKind {
    /// Flip between the local and remote flavor of a file kind, depending
    /// on whether the naming host is the local host. Non-file kinds are
    /// unchanged.
    pub fn localized(self, server_is_self: bool) -> HandleKind {
        match (self, server_is_self) {
            (HandleKind::LocalFile, false) => HandleKind::RemoteFile,
            (HandleKind::RemoteFile, true) => HandleKind::LocalFile,
            (k, _) => k,
        }
    }
}

/// Identifies an open stream: the host that created it plus a per-host
/// serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub origin: HostId,
    pub serial: u64,
}

/// Naming identifiers carried alongside a stream when it has a name.
/// Anonymous pipes migrate without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameIds {
    /// File ID of the name entry, used for get/set-attribute paths.
    pub file: FileId,
    /// Root of the prefix the name was resolved under; traps "..".
    pub root: FileId,
}

/// Everything a stream needs to move between hosts. Ephemeral: lives only
/// across one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEnvelope {
    pub stream_id: StreamId,
    pub io_id: FileId,
    pub name: Option<NameIds>,
    pub offset: i64,
    /// `use_flags` bits; NEW_STREAM is set by the target during
    /// deencapsulation, never by the origin.
    pub flags: u32,
    pub src_client: HostId,
}

/// Largest opaque blob an I/O server may return from a migrate call; the
/// blob seeds the target's handle-creation step.
pub const MIG_BLOB_MAX: usize = 256;

/// Reply from the I/O server to a migrate notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateReply {
    /// Possibly updated flags (REMOTE_SHARED may have been set).
    pub flags: u32,
    pub offset: i64,
    /// Opaque handler data consumed by the target's `mig_end` step.
    pub blob: Vec<u8>,
}

/// Reply payload for [`Command::GetTime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub unix_secs: i64,
    pub boot_gen: BootGen,
}

/// Reply payload for [`Command::PrefixLookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixAnswer {
    pub prefix: String,
    pub server: HostId,
    pub root: FileId,
}

// ============================================================================
// Payload helpers
// ============================================================================

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("bad frame magic")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),
    #[error("message of {0} bytes exceeds the fragment budget")]
    TooLarge(usize),
    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Split a message into wire frames. The body is the parameter bytes
/// followed by the data bytes; each frame's `frag_offset` indexes into
/// that combined body. `header` supplies everything but the size and
/// fragment fields. A zero-length body still produces one frame.
pub fn fragment(mut header: FrameHeader, params: &[u8], data: &[u8]) -> Result<Vec<Frame>> {
    header.param_size = params.len() as u32;
    header.data_size = data.len() as u32;

    let mut body = Vec::with_capacity(params.len() + data.len());
    body.extend_from_slice(params);
    body.extend_from_slice(data);

    let count = body.len().div_ceil(Frame::MAX_FRAGMENT_PAYLOAD).max(1);
    if count > Frame::MAX_FRAGMENTS {
        return Err(ProtoError::TooLarge(body.len()));
    }

    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * Frame::MAX_FRAGMENT_PAYLOAD;
        let end = (start + Frame::MAX_FRAGMENT_PAYLOAD).min(body.len());
        let mut h = header;
        h.frag_index = i as u16;
        h.frag_count = count as u16;
        h.frag_offset = start as u32;
        frames.push(Frame {
            header: h,
            payload: body[start..end].to_vec(),
        });
    }
    Ok(frames)
}

/// Serialize a payload body with the wire codec.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a payload body with the wire codec.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
