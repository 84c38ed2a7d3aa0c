// Session registry: the host's table of connected clients.
//
// One `SessionEntry` per admitted reliable connection, keyed by `ClientId`.
// The reliable server registers and unregisters entries; the unreliable
// server binds each entry's datagram address when the client announces it.
// Readers on either channel take a `snapshot()` (a cloned `Vec`) and do their
// I/O outside the lock, so a slow peer never stalls registration or routing.
//
// Each entry holds an `Arc<ConnectionHandle>`: the write half of the TCP
// stream behind its own mutex, so whole records from different threads
// never interleave on the wire.

use std::collections::BTreeMap;
use std::io::{self, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lanparty_protocol::{ClientId, write_frame};
use tracing::debug;

use crate::error::NetError;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The writable side of one reliable connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ClientId,
    peer: SocketAddr,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
}

impl ConnectionHandle {
    pub fn new(id: ClientId, stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let writer = Mutex::new(BufWriter::new(stream.try_clone()?));
        Ok(Self {
            id,
            peer,
            stream,
            writer,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write one framed record. Concurrent callers are serialized.
    pub fn send(&self, record: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        write_frame(&mut *writer, record)
    }

    /// Run `before` with the writer held, then write `record`. Nothing else
    /// can write to this connection in between, and `record` is not written
    /// if `before` fails.
    pub fn send_after<F>(&self, record: &[u8], before: F) -> Result<(), NetError>
    where
        F: FnOnce() -> Result<(), NetError>,
    {
        let mut writer = lock(&self.writer);
        before()?;
        write_frame(&mut *writer, record)?;
        Ok(())
    }

    /// Shut the socket down in both directions, which also wakes the
    /// connection's blocked reader.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(id = %self.id, error = %e, "shutdown on closed connection");
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub id: ClientId,
    pub reliable: Arc<ConnectionHandle>,
    /// Set once the client announces its datagram address.
    pub unreliable_address: Option<SocketAddr>,
}

/// Outcome of a successful `bind_unreliable_address`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Bound,
    /// The same address was already bound (a repeated announcement).
    Unchanged,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<BTreeMap<ClientId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ClientId, reliable: Arc<ConnectionHandle>) -> Result<(), NetError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&id) {
            return Err(NetError::DuplicateClient(id));
        }
        entries.insert(
            id,
            SessionEntry {
                id,
                reliable,
                unreliable_address: None,
            },
        );
        Ok(())
    }

    /// Remove an entry. Only the first call for a given id returns it, which
    /// is what makes disconnect notifications fire exactly once.
    pub fn unregister(&self, id: ClientId) -> Option<SessionEntry> {
        lock(&self.entries).remove(&id)
    }

    /// Attach a datagram source address to an existing entry. A different
    /// address than the one already bound is refused.
    pub fn bind_unreliable_address(
        &self,
        id: ClientId,
        address: SocketAddr,
    ) -> Result<Binding, NetError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&id)
            .ok_or(NetError::UnknownSession(id))?;
        match entry.unreliable_address {
            None => {
                entry.unreliable_address = Some(address);
                Ok(Binding::Bound)
            }
            Some(bound) if bound == address => Ok(Binding::Unchanged),
            Some(bound) => Err(NetError::AddressConflict {
                id,
                bound,
                offered: address,
            }),
        }
    }

    pub fn get(&self, id: ClientId) -> Option<SessionEntry> {
        lock(&self.entries).get(&id).cloned()
    }

    /// An immutable copy of every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        lock(&self.entries).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        lock(&self.entries).contains_key(&id)
    }
}
