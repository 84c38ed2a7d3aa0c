// Unreliable (UDP) server: the host side of the datagram channel.
//
// One socket, one receive thread. Each datagram is one envelope:
//
// - `DiscoveryRequest` is answered immediately with the host descriptor.
// - `UnreliableConnectRequest` binds the datagram's source address to the
//   registry entry for `senderId`. There is no acknowledgement; clients
//   repeat the announcement a few times instead.
// - Anything else must come from a registered client. It is queued as
//   `MessageReceived` and forwarded per `route` to the recipients' bound
//   addresses.
//
// The socket has a read timeout of `poll_interval` so the loop notices
// `stop()` without a wake-up datagram. Sends are fire-and-forget: a failed
// `send_to` is a warning, never a reason to stop the loop.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use lanparty_protocol::{Channel, ClientId, Envelope, Message, Route, decode, encode, route};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::discovery::{DATAGRAM_BUFFER, HostAdvert, answer_probe, is_transient};
use crate::error::{NetError, is_timeout};
use crate::event::{NetEvent, Service};
use crate::registry::{Binding, SessionRegistry};

struct Shared {
    socket: UdpSocket,
    keep_running: AtomicBool,
    registry: Arc<SessionRegistry>,
    events: Sender<NetEvent>,
    advert: HostAdvert,
}

impl Shared {
    fn emit(&self, event: NetEvent) {
        let _ = self.events.send(event);
    }

    fn running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

/// Handle to a running unreliable server. Dropping it stops the server.
pub struct UnreliableServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl UnreliableServer {
    /// Bind `config.bind_address:port`. `reliable_port` is only used for
    /// the descriptor this server hands out to discovery probes.
    pub fn start(
        config: &NetConfig,
        port: u16,
        reliable_port: u16,
        registry: Arc<SessionRegistry>,
        events: Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_address, port))?;
        socket.set_read_timeout(Some(config.poll_interval()))?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(Shared {
            socket,
            keep_running: AtomicBool::new(true),
            advert: HostAdvert::new(config, reliable_port, local_addr.port(), registry.clone()),
            registry,
            events,
        });

        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("unreliable-server".into())
            .spawn(move || receive_loop(loop_shared))?;

        info!(%local_addr, "unreliable server listening");
        Ok(Self {
            local_addr,
            shared,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// What this host advertises, for the discovery listener.
    pub fn advert(&self) -> HostAdvert {
        self.shared.advert.clone()
    }

    /// Send a host-originated envelope to the bound addresses of its
    /// recipients. A unicast target that is missing or has not announced
    /// its address is an error; unbound broadcast recipients are skipped.
    pub fn send_to(&self, envelope: &Envelope) -> Result<(), NetError> {
        if !self.shared.running() {
            return Err(NetError::NotRunning);
        }
        let record = encode(envelope)?;
        let route = route(
            envelope.sender_id,
            envelope.target_id,
            self.shared.registry.ids(),
        );
        forward(&self.shared, &route, &record)
    }

    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.keep_running.store(false, Ordering::SeqCst);
        let _ = thread.join();
        info!(local_addr = %self.local_addr, "unreliable server stopped");
    }
}

impl Drop for UnreliableServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    while shared.running() {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, src)) => handle_datagram(&shared, &buf[..len], src),
            Err(ref e) if is_timeout(e) || is_transient(e) => {}
            Err(e) => {
                warn!(error = %e, "unreliable receive failed, closing");
                shared.emit(NetEvent::ConnectionError(e.into()));
                break;
            }
        }
    }
    shared.emit(NetEvent::ServiceStopped(Service::UnreliableReceive));
}

fn handle_datagram(shared: &Shared, datagram: &[u8], src: SocketAddr) {
    let envelope = match decode(datagram) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%src, error = %e, "dropping malformed datagram");
            shared.emit(NetEvent::Warning(e.into()));
            return;
        }
    };

    match envelope.message {
        Message::DiscoveryRequest => {
            if let Err(e) = answer_probe(&shared.socket, src, &shared.advert) {
                warn!(%src, error = %e, "cannot answer discovery probe");
                shared.emit(NetEvent::Warning(e));
            }
        }
        Message::UnreliableConnectRequest => bind_sender(shared, envelope.sender_id, src),
        Message::HostDescriptor(_) => {
            debug!(%src, "ignoring stray host descriptor");
        }
        _ => relay(shared, envelope, src),
    }
}

fn bind_sender(shared: &Shared, id: ClientId, src: SocketAddr) {
    match shared.registry.bind_unreliable_address(id, src) {
        Ok(Binding::Bound) => info!(%id, %src, "unreliable address bound"),
        Ok(Binding::Unchanged) => debug!(%id, %src, "repeated unreliable announcement"),
        Err(e) => {
            warn!(%id, %src, error = %e, "rejecting unreliable announcement");
            shared.emit(NetEvent::Warning(e));
        }
    }
}

fn relay(shared: &Shared, envelope: Envelope, src: SocketAddr) {
    let sender = envelope.sender_id;
    if !shared.registry.contains(sender) {
        warn!(%src, %sender, tag = envelope.message.tag(), "datagram from unknown session");
        shared.emit(NetEvent::Warning(NetError::UnknownSession(sender)));
        return;
    }

    let route = route(sender, envelope.target_id, shared.registry.ids());
    let forward_record = match route {
        Route::Local => None,
        _ => Some(encode(&envelope)),
    };

    shared.emit(NetEvent::MessageReceived {
        from: sender,
        channel: Channel::Unreliable,
        envelope,
    });

    let result = match forward_record {
        Some(Ok(record)) => forward(shared, &route, &record),
        Some(Err(e)) => Err(e.into()),
        None => Ok(()),
    };
    if let Err(e) = result {
        warn!(%sender, error = %e, "cannot forward datagram");
        shared.emit(NetEvent::Warning(e));
    }
}

/// Send `record` to the bound addresses `route` selects.
fn forward(shared: &Shared, route: &Route, record: &[u8]) -> Result<(), NetError> {
    match route {
        Route::Local => Ok(()),
        Route::NotFound(id) => Err(NetError::TargetNotFound(*id)),
        Route::Unicast(id) => {
            let entry = shared
                .registry
                .get(*id)
                .ok_or(NetError::TargetNotFound(*id))?;
            let address = entry
                .unreliable_address
                .ok_or(NetError::UnboundAddress(*id))?;
            shared.socket.send_to(record, address)?;
            Ok(())
        }
        Route::Broadcast(ids) => {
            for entry in shared.registry.snapshot() {
                if !ids.contains(&entry.id) {
                    continue;
                }
                let Some(address) = entry.unreliable_address else {
                    debug!(id = %entry.id, "skipping client without unreliable address");
                    continue;
                };
                if let Err(e) = shared.socket.send_to(record, address) {
                    warn!(id = %entry.id, %address, error = %e, "unreliable send failed");
                    shared.emit(NetEvent::Warning(e.into()));
                }
            }
            Ok(())
        }
    }
}
