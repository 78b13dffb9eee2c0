//! Client-side open-stream objects and the per-host stream table.

use drift_proto::{FileId, HostId, StreamId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Naming state carried by a stream that was opened by path. Anonymous
/// pipes have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameInfo {
    /// File ID of the name entry; used for get/set-attribute traffic.
    pub file: FileId,
    /// Root of the prefix the name lives under; traps "..".
    pub root: FileId,
    /// Mounted prefix the root resolves through, when installed.
    pub prefix: Option<String>,
}

/// A per-host open-file object: offset, access flags, the I/O handle it
/// references (by ID, looked up at the I/O server or in the local handle
/// table), and the hosts currently holding references to it.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub io_id: FileId,
    pub offset: i64,
    pub flags: u32,
    pub name: Option<NameInfo>,
    pub clients: Vec<HostId>,
    pub refs: u32,
}

/// The table of streams known to this host.
pub struct StreamTable {
    local_host: HostId,
    serial: AtomicU64,
    streams: Mutex<HashMap<StreamId, Stream>>,
}

impl StreamTable {
    pub fn new(local_host: HostId) -> Self {
        Self {
            local_host,
            serial: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_host(&self) -> HostId {
        self.local_host
    }

    /// Open a fresh local stream.
    pub fn create(
        &self,
        io_id: FileId,
        flags: u32,
        offset: i64,
        name: Option<NameInfo>,
    ) -> StreamId {
        let id = StreamId {
            origin: self.local_host,
            serial: self.serial.fetch_add(1, Ordering::Relaxed),
        };
        let stream = Stream {
            id,
            io_id,
            offset,
            flags,
            name,
            clients: vec![self.local_host],
            refs: 1,
        };
        self.streams.lock().unwrap().insert(id, stream);
        id
    }

    pub fn get(&self, id: &StreamId) -> Option<Stream> {
        self.streams.lock().unwrap().get(id).cloned()
    }

    /// Reference a stream on behalf of `client`, creating the stream
    /// object if this host has never seen it. Returns
    /// `(found_client, found_stream)`: whether the client already held a
    /// reference, and whether the stream object already existed here.
    pub fn add_client(
        &self,
        id: StreamId,
        client: HostId,
        io_id: FileId,
        flags: u32,
    ) -> (bool, bool) {
        let mut streams = self.streams.lock().unwrap();
        match streams.get_mut(&id) {
            Some(stream) => {
                let found_client = stream.clients.contains(&client);
                if !found_client {
                    stream.clients.push(client);
                }
                stream.refs += 1;
                (found_client, true)
            }
            None => {
                streams.insert(
                    id,
                    Stream {
                        id,
                        io_id,
                        offset: 0,
                        flags,
                        name: None,
                        clients: vec![client],
                        refs: 1,
                    },
                );
                (false, false)
            }
        }
    }

    /// Apply a closure to a stream under the table lock.
    pub fn with_mut<R>(&self, id: &StreamId, f: impl FnOnce(&mut Stream) -> R) -> Option<R> {
        self.streams.lock().unwrap().get_mut(id).map(f)
    }

    /// Drop one reference held by `client`. When `destroy_if_last` is set
    /// and this was the last reference anywhere, the stream object is
    /// removed entirely (the back-out path for a failed migration).
    pub fn release(&self, id: &StreamId, client: HostId, destroy_if_last: bool) {
        let mut streams = self.streams.lock().unwrap();
        let Some(stream) = streams.get_mut(id) else {
            return;
        };
        stream.refs = stream.refs.saturating_sub(1);
        if stream.refs == 0 {
            stream.clients.retain(|c| *c != client);
        }
        if destroy_if_last && stream.refs == 0 {
            streams.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
