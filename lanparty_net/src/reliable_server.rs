// Reliable (TCP) server: the host side of the stream channel.
//
// Architecture: thread-per-reader, all events funneled into one `mpsc`
// sender.
//
// - **Accept thread**: polls a non-blocking `TcpListener`, sleeping
//   `poll_interval` between attempts so it can notice `stop()`. Each accepted
//   stream gets the next id (2, 3, ...), is entered in the registry, is
//   told its id with a `RegisteredClient` record, and gets a reader thread.
//   Connections past `max_clients` are closed immediately. If accepting
//   fails for good, the server stops reporting itself as running while
//   existing connections carry on.
// - **Reader threads** (one per connection): read one line at a time, decode
//   it, queue `MessageReceived`, and forward the envelope per `route`. A
//   malformed line is dropped with a warning and the loop keeps going; EOF
//   or a read error ends the connection.
//
// Writes go through each connection's own `ConnectionHandle` mutex, so a
// reader forwarding to a peer never interleaves with the host or another
// reader writing to the same peer, and never touches the registry lock.
//
// Disconnect is owned by the reader: whoever wins `registry.unregister(id)`
// closes the socket and emits `ClientDisconnected(id)`, so it fires once per
// connection regardless of who noticed first. `stop()` only shuts sockets
// down and lets the readers do the rest.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lanparty_protocol::{
    Channel, ClientId, Envelope, Route, Target, decode, encode, read_frame, route,
};
use tracing::{debug, error, info, warn};

use crate::config::NetConfig;
use crate::error::NetError;
use crate::event::{NetEvent, Service};
use crate::registry::{ConnectionHandle, SessionRegistry, lock};

/// State shared between the server handle, the accept thread and readers.
struct Shared {
    keep_running: AtomicBool,
    /// Cleared when the accept loop exits for any reason.
    accepting: AtomicBool,
    registry: Arc<SessionRegistry>,
    events: Sender<NetEvent>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    max_clients: usize,
    poll_interval: Duration,
}

impl Shared {
    fn emit(&self, event: NetEvent) {
        let _ = self.events.send(event);
    }

    fn running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

/// Handle to a running reliable server. Dropping it stops the server.
pub struct ReliableServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ReliableServer {
    /// Bind `config.bind_address:port` and start accepting. Port 0 picks a
    /// free port; see `local_addr()`.
    pub fn start(
        config: &NetConfig,
        port: u16,
        registry: Arc<SessionRegistry>,
        events: Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            keep_running: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            registry,
            events,
            readers: Mutex::new(Vec::new()),
            max_clients: config.max_clients,
            poll_interval: config.poll_interval(),
        });

        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("reliable-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        info!(%local_addr, "reliable server listening");
        Ok(Self {
            local_addr,
            shared,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while the server is neither stopped nor unable to accept.
    pub fn is_running(&self) -> bool {
        self.shared.running() && self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Send a host-originated envelope per its target.
    ///
    /// A local target (`Server` or the host's own id) sends nothing; the
    /// caller delivers those itself. A missing unicast target is an error.
    /// Failures writing to individual recipients are queued as warnings.
    pub fn send_to(&self, envelope: &Envelope) -> Result<(), NetError> {
        if !self.shared.running() {
            return Err(NetError::NotRunning);
        }
        let record = encode(envelope)?;
        match route(
            envelope.sender_id,
            envelope.target_id,
            self.shared.registry.ids(),
        ) {
            Route::Local => Ok(()),
            Route::NotFound(id) => Err(NetError::TargetNotFound(id)),
            route => {
                deliver(&self.shared, route.recipients(), &record);
                Ok(())
            }
        }
    }

    /// Stop accepting, close every live connection, and wait for all threads
    /// to exit. Each closed connection produces one `ClientDisconnected`.
    /// Calling this more than once is harmless.
    pub fn stop(&mut self) {
        let Some(accept_thread) = self.accept_thread.take() else {
            return;
        };
        self.shared.keep_running.store(false, Ordering::SeqCst);
        let _ = accept_thread.join();

        for entry in self.shared.registry.snapshot() {
            entry.reliable.close();
        }
        let readers = std::mem::take(&mut *lock(&self.shared.readers));
        for reader in readers {
            let _ = reader.join();
        }

        // Anything a reader did not get to (there should be nothing).
        for entry in self.shared.registry.snapshot() {
            close_connection(&self.shared, entry.id);
        }
        info!(local_addr = %self.local_addr, "reliable server stopped");
    }
}

impl Drop for ReliableServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut next_id = ClientId::FIRST_ASSIGNED;
    while shared.running() {
        match listener.accept() {
            Ok((stream, peer)) => match admit(&shared, stream, peer, next_id) {
                Ok(true) => next_id = ClientId(next_id.0 + 1),
                Ok(false) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "failed to admit connection");
                    shared.emit(NetEvent::Warning(e));
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(shared.poll_interval);
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) => {}
            Err(e) => {
                accept_failed(&shared, e);
                break;
            }
        }
    }
    shared.accepting.store(false, Ordering::SeqCst);
    shared.emit(NetEvent::ServiceStopped(Service::ReliableAccept));
}

fn accept_failed(shared: &Shared, e: io::Error) {
    error!(error = %e, "accept failed, closing reliable listener");
    shared.accepting.store(false, Ordering::SeqCst);
    shared.emit(NetEvent::ConnectionError(e.into()));
}

/// Register a freshly accepted stream under `id` and start its reader.
/// Returns `Ok(false)` if the connection was refused without using the id.
fn admit(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    id: ClientId,
) -> Result<bool, NetError> {
    stream.set_nonblocking(false)?;
    if shared.registry.len() >= shared.max_clients {
        warn!(%peer, max_clients = shared.max_clients, "session full, refusing connection");
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(false);
    }
    stream.set_nodelay(true)?;

    let conn = Arc::new(ConnectionHandle::new(id, stream.try_clone()?)?);
    let registered = encode(&Envelope::registered(id))?;
    // Registering under the writer lock keeps the identity record the first
    // line the client reads, and the entry exists before the client can
    // announce its datagram address.
    let sent = conn.send_after(&registered, || shared.registry.register(id, conn.clone()));
    if let Err(e) = sent {
        if shared
            .registry
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.reliable, &conn))
        {
            shared.registry.unregister(id);
        }
        return Err(e);
    }
    info!(%id, %peer, "client connected");
    shared.emit(NetEvent::ClientConnected(id));

    let reader = BufReader::new(stream);
    let reader_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("reliable-reader-{id}"))
        .spawn(move || reader_loop(reader, id, reader_shared));
    match spawned {
        Ok(handle) => {
            let mut readers = lock(&shared.readers);
            readers.retain(|reader| !reader.is_finished());
            readers.push(handle);
            Ok(true)
        }
        Err(e) => {
            close_connection(shared, id);
            Err(e.into())
        }
    }
}

fn reader_loop(mut reader: BufReader<TcpStream>, id: ClientId, shared: Arc<Shared>) {
    loop {
        match read_frame(&mut reader) {
            Ok(Some(record)) => handle_record(&shared, id, &record),
            Ok(None) => {
                debug!(%id, "peer closed reliable connection");
                break;
            }
            Err(e) => {
                if shared.running() {
                    warn!(%id, error = %e, "reliable read failed");
                    shared.emit(NetEvent::Warning(e.into()));
                }
                break;
            }
        }
    }
    close_connection(&shared, id);
}

fn handle_record(shared: &Shared, id: ClientId, record: &[u8]) {
    let mut envelope = match decode(record) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%id, error = %e, "dropping malformed record");
            shared.emit(NetEvent::Warning(e.into()));
            return;
        }
    };
    if envelope.message.is_control() {
        debug!(%id, tag = envelope.message.tag(), "ignoring control message on reliable channel");
        return;
    }
    if envelope.sender_id != id {
        debug!(%id, claimed = %envelope.sender_id, "rewriting sender id");
        envelope.sender_id = id;
    }

    let route = route(id, envelope.target_id, shared.registry.ids());
    let forward = match &route {
        Route::Local => None,
        Route::NotFound(target) => {
            warn!(%id, %target, "unicast target not found");
            shared.emit(NetEvent::Warning(NetError::TargetNotFound(*target)));
            None
        }
        Route::Broadcast(_) | Route::Unicast(_) => Some(encode(&envelope)),
    };

    shared.emit(NetEvent::MessageReceived {
        from: id,
        channel: Channel::Reliable,
        envelope,
    });

    match forward {
        Some(Ok(record)) => deliver(shared, route.recipients(), &record),
        Some(Err(e)) => {
            warn!(%id, error = %e, "cannot re-encode envelope for forwarding");
            shared.emit(NetEvent::Warning(e.into()));
        }
        None => {}
    }
}

/// Write `record` to each recipient. Per-recipient failures are warnings;
/// the recipient's own reader will notice a dead socket.
fn deliver(shared: &Shared, recipients: &[ClientId], record: &[u8]) {
    if recipients.is_empty() {
        return;
    }
    for entry in shared.registry.snapshot() {
        if !recipients.contains(&entry.id) {
            continue;
        }
        if let Err(e) = entry.reliable.send(record) {
            warn!(id = %entry.id, error = %e, "reliable send failed");
            shared.emit(NetEvent::Warning(e.into()));
        }
    }
}

/// Tear down connection `id` if nobody else has. Emits `ClientDisconnected`
/// and, while the server is still running, tells the remaining clients.
fn close_connection(shared: &Shared, id: ClientId) {
    let Some(entry) = shared.registry.unregister(id) else {
        return;
    };
    entry.reliable.close();
    info!(%id, peer = %entry.reliable.peer(), "client disconnected");
    shared.emit(NetEvent::ClientDisconnected(id));

    if shared.running() {
        let notice = Envelope::departed(id);
        match encode(&notice) {
            Ok(record) => {
                let route = route(ClientId::HOST, Target::Broadcast, shared.registry.ids());
                deliver(shared, route.recipients(), &record);
            }
            Err(e) => shared.emit(NetEvent::Warning(e.into())),
        }
    }
}
