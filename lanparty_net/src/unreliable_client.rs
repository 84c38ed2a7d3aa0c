// Unreliable (UDP) client: the joining side of the datagram channel.
//
// The socket is connected to the host's unreliable port, so the OS filters
// out datagrams from anyone else and `send` needs no address. The receive
// thread queues each decoded datagram as `MessageReceived`; it polls with a
// read timeout so `close()` can stop it.
//
// Until the host has bound this socket's address (see `announce`), nothing
// is delivered here: the host has nowhere to send. Like the reliable
// client, the receive thread waits for `start()` before reading, and a
// client closed before that reports nothing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use lanparty_protocol::{Channel, ClientId, Envelope, Message, decode, encode};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::discovery::{DATAGRAM_BUFFER, is_transient};
use crate::error::{NetError, is_timeout};
use crate::event::{NetEvent, Service};

pub struct UnreliableClient {
    socket: UdpSocket,
    server: SocketAddr,
    keep_running: Arc<AtomicBool>,
    gate: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl UnreliableClient {
    pub fn connect(
        server: SocketAddr,
        config: &NetConfig,
        events: Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let local: IpAddr = match server.ip() {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
        socket.connect(server)?;
        socket.set_read_timeout(Some(config.poll_interval()))?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let (gate, parked) = mpsc::channel();
        let loop_socket = socket.try_clone()?;
        let loop_running = keep_running.clone();
        let thread = thread::Builder::new()
            .name("unreliable-client".into())
            .spawn(move || receive_loop(loop_socket, parked, loop_running, events))?;

        debug!(%server, local = ?socket.local_addr().ok(), "unreliable client ready");
        Ok(Self {
            socket,
            server,
            keep_running,
            gate: Some(gate),
            thread: Some(thread),
        })
    }

    /// Let the receive thread deliver. Calling this more than once is
    /// harmless.
    pub fn start(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), NetError> {
        if self.thread.is_none() {
            return Err(NetError::NotRunning);
        }
        let record = encode(envelope)?;
        self.socket.send(&record)?;
        Ok(())
    }

    /// Tell the host which address belongs to `id`. The announcement is a
    /// plain datagram, so it is repeated `attempts` times; it succeeds if at
    /// least one copy left the socket.
    pub fn announce(&self, id: ClientId, attempts: u32) -> Result<(), NetError> {
        let announcement = Envelope::unreliable_announce(id);
        let mut last_error = None;
        let mut sent = 0;
        for _ in 0..attempts.max(1) {
            match self.send(&announcement) {
                Ok(()) => sent += 1,
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) if sent == 0 => Err(e),
            _ => {
                info!(%id, server = %self.server, "unreliable address announced");
                Ok(())
            }
        }
    }

    /// Stop the receive thread. Calling this more than once is harmless.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.gate = None;
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = thread.join();
        debug!(server = %self.server, "unreliable client closed");
    }
}

impl Drop for UnreliableClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    socket: UdpSocket,
    parked: Receiver<()>,
    keep_running: Arc<AtomicBool>,
    events: Sender<NetEvent>,
) {
    if parked.recv().is_err() {
        return;
    }
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    while keep_running.load(Ordering::SeqCst) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(ref e) if is_timeout(e) => continue,
            Err(ref e) if is_transient(e) => {
                // The host port is not (or no longer) listening.
                debug!(error = %e, "unreliable peer unreachable");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "unreliable receive failed, closing");
                let _ = events.send(NetEvent::ConnectionError(e.into()));
                break;
            }
        };
        match decode(&buf[..len]) {
            Ok(Envelope {
                message: Message::HostDescriptor(_),
                ..
            }) => {}
            Ok(envelope) => {
                let _ = events.send(NetEvent::MessageReceived {
                    from: envelope.sender_id,
                    channel: Channel::Unreliable,
                    envelope,
                });
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed datagram from host");
                let _ = events.send(NetEvent::Warning(e.into()));
            }
        }
    }
    let _ = events.send(NetEvent::ServiceStopped(Service::UnreliableReceive));
}
