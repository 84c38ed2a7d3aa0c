// LAN host discovery.
//
// Discovering side: `discover()` broadcasts one `DiscoveryRequest` to the
// discovery port and collects `HostDescriptor` replies until the window
// closes. Replies are de-duplicated by (address, reliable port). No replies
// is an empty list, not an error.
//
// Host side: `DiscoveryListener` answers probes on the well-known discovery
// port. The unreliable server also answers probes sent straight to its own
// port; both go through `answer_probe`. A host that cannot bind the
// discovery port (another host on the same machine already has it) still
// runs and is reachable by address.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lanparty_protocol::{Envelope, HostDescriptor, Message, decode, encode};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::error::{NetError, is_timeout};
use crate::event::{NetEvent, Service};
use crate::registry::SessionRegistry;

/// Largest datagram either side expects to receive.
pub(crate) const DATAGRAM_BUFFER: usize = 64 * 1024;

/// What a running host says about itself. The player count is read from
/// the registry at reply time.
#[derive(Clone, Debug)]
pub struct HostAdvert {
    pub display_name: String,
    pub address: String,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    registry: Arc<SessionRegistry>,
}

impl HostAdvert {
    pub fn new(
        config: &NetConfig,
        reliable_port: u16,
        unreliable_port: u16,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            display_name: config.display_name.clone(),
            address: config.advertise_address.clone(),
            reliable_port,
            unreliable_port,
            registry,
        }
    }

    /// A descriptor reflecting the current session. The host counts as a
    /// player.
    pub fn descriptor(&self) -> HostDescriptor {
        HostDescriptor {
            display_name: self.display_name.clone(),
            address: self.address.clone(),
            reliable_port: self.reliable_port,
            unreliable_port: self.unreliable_port,
            player_count: u32::try_from(self.registry.len() + 1).unwrap_or(u32::MAX),
        }
    }
}

/// Reply to a probe from `src` with the host's descriptor.
pub fn answer_probe(
    socket: &UdpSocket,
    src: SocketAddr,
    advert: &HostAdvert,
) -> Result<(), NetError> {
    let reply = encode(&Envelope::host_reply(advert.descriptor()))?;
    socket.send_to(&reply, src)?;
    debug!(%src, "answered discovery probe");
    Ok(())
}

/// Answers discovery probes on the well-known port until stopped.
pub struct DiscoveryListener {
    local_addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiscoveryListener {
    pub fn start(
        config: &NetConfig,
        advert: HostAdvert,
        events: Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_address, config.discovery_port))?;
        socket.set_read_timeout(Some(config.poll_interval()))?;
        let local_addr = socket.local_addr()?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let loop_running = keep_running.clone();
        let thread = thread::Builder::new()
            .name("discovery-listener".into())
            .spawn(move || listen_loop(socket, advert, loop_running, events))?;

        info!(%local_addr, "discovery listener started");
        Ok(Self {
            local_addr,
            keep_running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = thread.join();
        debug!(local_addr = %self.local_addr, "discovery listener stopped");
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    socket: UdpSocket,
    advert: HostAdvert,
    keep_running: Arc<AtomicBool>,
    events: Sender<NetEvent>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    while keep_running.load(Ordering::SeqCst) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if is_timeout(e) || is_transient(e) => continue,
            Err(e) => {
                warn!(error = %e, "discovery listener failed");
                let _ = events.send(NetEvent::ConnectionError(e.into()));
                break;
            }
        };
        match decode(&buf[..len]) {
            Ok(Envelope {
                message: Message::DiscoveryRequest,
                ..
            }) => {
                if let Err(e) = answer_probe(&socket, src, &advert) {
                    warn!(%src, error = %e, "cannot answer discovery probe");
                    let _ = events.send(NetEvent::Warning(e));
                }
            }
            Ok(envelope) => {
                debug!(%src, tag = envelope.message.tag(), "ignoring datagram on discovery port");
            }
            Err(e) => {
                warn!(%src, error = %e, "dropping malformed datagram on discovery port");
                let _ = events.send(NetEvent::Warning(e.into()));
            }
        }
    }
    let _ = events.send(NetEvent::ServiceStopped(Service::DiscoveryListener));
}

/// Errors a UDP receive can report for an earlier send (ICMP unreachable)
/// that say nothing about the socket itself.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Broadcast a probe and collect host replies for `config.discovery_window`.
pub fn discover(config: &NetConfig) -> Result<Vec<HostDescriptor>, NetError> {
    let local: IpAddr = match config.discovery_target {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
    socket.set_broadcast(true)?;

    let probe = encode(&Envelope::discovery_probe())?;
    let target = SocketAddr::new(config.discovery_target, config.discovery_port);
    socket.send_to(&probe, target)?;
    debug!(%target, window_ms = config.discovery_window_ms, "discovery probe sent");

    let deadline = Instant::now() + config.discovery_window();
    let mut seen = BTreeSet::new();
    let mut hosts = Vec::new();
    let mut buf = vec![0u8; DATAGRAM_BUFFER];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        // A zero read timeout is rejected by the OS.
        socket.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if is_timeout(e) || is_transient(e) => continue,
            Err(e) => return Err(e.into()),
        };
        match decode(&buf[..len]) {
            Ok(Envelope {
                message: Message::HostDescriptor(descriptor),
                ..
            }) => {
                let descriptor = with_reply_address(descriptor, src);
                if seen.insert((descriptor.address.clone(), descriptor.reliable_port)) {
                    info!(
                        name = %descriptor.display_name,
                        address = %descriptor.address,
                        port = descriptor.reliable_port,
                        players = descriptor.player_count,
                        "found host"
                    );
                    hosts.push(descriptor);
                }
            }
            Ok(envelope) => {
                debug!(%src, tag = envelope.message.tag(), "ignoring non-descriptor reply");
            }
            Err(e) => {
                debug!(%src, error = %e, "ignoring malformed discovery reply");
            }
        }
    }

    info!(hosts = hosts.len(), "discovery finished");
    Ok(hosts)
}

/// Fill in the host address from the reply's source when the host did not
/// advertise a usable one.
fn with_reply_address(mut descriptor: HostDescriptor, src: SocketAddr) -> HostDescriptor {
    let usable = descriptor
        .address
        .parse::<IpAddr>()
        .map(|ip| !ip.is_unspecified())
        .unwrap_or(!descriptor.address.trim().is_empty());
    if !usable {
        descriptor.address = src.ip().to_string();
    }
    descriptor
}
