// Session orchestrator.
//
// `Session` is what an application holds. It owns the event queue, the
// handler, and whichever transports the current role needs:
//
// - **Host**: a `ReliableServer`, an `UnreliableServer` on the paired port,
//   and (when the port is free) a `DiscoveryListener`, all sharing one
//   `SessionRegistry`. The host's own identity is id 1.
// - **Client**: a `ReliableClient` (which obtains the id) and an
//   `UnreliableClient` that announces its address under that id.
//
// Bring-up is strictly ordered (reliable, identity, unreliable,
// announcement) and all-or-nothing: on failure everything already started is
// dropped, one `ConnectionError` is queued, and the error is returned. A
// client's receive threads are released only after `ClientConnected` is
// queued, so nothing from the host is dispatched ahead of it.
// Teardown goes through one routine, `shutdown_transport`, used by
// `disconnect()`, by `Drop`, and when a client loses its reliable
// connection.
//
// Background threads only ever push `NetEvent`s. `tick()` drains the queue
// on the caller's thread and runs the handler there; sends the handler
// queues in its `Outbox` are flushed right after each event.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use lanparty_protocol::{
    Channel, ClientId, Envelope, HostDescriptor, Message, Route, Target, route,
};
use tracing::{debug, error, info, warn};

use crate::config::NetConfig;
use crate::discovery::{DiscoveryListener, discover};
use crate::error::NetError;
use crate::event::{EventQueue, NetEvent, NetHandler, Outbox};
use crate::registry::SessionRegistry;
use crate::reliable_client::{ConnectionState, ReliableClient};
use crate::reliable_server::ReliableServer;
use crate::unreliable_client::UnreliableClient;
use crate::unreliable_server::UnreliableServer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    None,
    Host,
    Client,
}

/// Ports a running host actually bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPorts {
    pub reliable: u16,
    pub unreliable: u16,
    /// `None` if the discovery port was unavailable.
    pub discovery: Option<u16>,
}

enum Transport {
    Idle,
    Host {
        registry: Arc<SessionRegistry>,
        reliable: ReliableServer,
        unreliable: UnreliableServer,
        discovery: Option<DiscoveryListener>,
    },
    Client {
        id: ClientId,
        reliable: ReliableClient,
        unreliable: UnreliableClient,
    },
}

pub struct Session<H: NetHandler> {
    config: NetConfig,
    handler: H,
    queue: EventQueue,
    transport: Transport,
}

impl<H: NetHandler> Session<H> {
    pub fn new(config: NetConfig, handler: H) -> Self {
        Self {
            config,
            handler,
            queue: EventQueue::new(),
            transport: Transport::Idle,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn role(&self) -> Role {
        match self.transport {
            Transport::Idle => Role::None,
            Transport::Host { .. } => Role::Host,
            Transport::Client { .. } => Role::Client,
        }
    }

    /// This process's identity: 1 when hosting, the assigned id when joined.
    pub fn local_id(&self) -> Option<ClientId> {
        match &self.transport {
            Transport::Idle => None,
            Transport::Host { .. } => Some(ClientId::HOST),
            Transport::Client { id, .. } => Some(*id),
        }
    }

    /// True once bring-up finished and the reliable channel is still up.
    pub fn is_ready(&self) -> bool {
        match &self.transport {
            Transport::Idle => false,
            Transport::Host { reliable, .. } => reliable.is_running(),
            Transport::Client { reliable, .. } => {
                reliable.state() == ConnectionState::Connected
            }
        }
    }

    pub fn host_ports(&self) -> Option<HostPorts> {
        match &self.transport {
            Transport::Host {
                reliable,
                unreliable,
                discovery,
                ..
            } => Some(HostPorts {
                reliable: reliable.local_addr().port(),
                unreliable: unreliable.local_addr().port(),
                discovery: discovery.as_ref().map(|d| d.local_addr().port()),
            }),
            _ => None,
        }
    }

    /// Ids of the clients registered with this host. Empty unless hosting.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        match &self.transport {
            Transport::Host { registry, .. } => registry.ids(),
            _ => Vec::new(),
        }
    }

    /// The datagram address a client announced, as seen by this host.
    pub fn unreliable_address(&self, id: ClientId) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Host { registry, .. } => {
                registry.get(id).and_then(|entry| entry.unreliable_address)
            }
            _ => None,
        }
    }

    /// Start hosting on `port` (0 for any free port).
    pub fn start_host(&mut self, port: u16) -> Result<HostPorts, NetError> {
        if !matches!(self.transport, Transport::Idle) {
            return Err(NetError::AlreadyRunning);
        }
        match self.bring_up_host(port) {
            Ok(transport) => {
                self.transport = transport;
                let ports = self.host_ports().ok_or(NetError::NotRunning)?;
                info!(
                    reliable = ports.reliable,
                    unreliable = ports.unreliable,
                    discovery = ?ports.discovery,
                    "hosting session"
                );
                Ok(ports)
            }
            Err(e) => Err(self.bring_up_failed(e)),
        }
    }

    fn bring_up_host(&self, port: u16) -> Result<Transport, NetError> {
        self.config.validate()?;
        let registry = Arc::new(SessionRegistry::new());
        let reliable =
            ReliableServer::start(&self.config, port, registry.clone(), self.queue.sender())?;
        let reliable_port = reliable.local_addr().port();
        let unreliable = UnreliableServer::start(
            &self.config,
            self.config.unreliable_port_for(port),
            reliable_port,
            registry.clone(),
            self.queue.sender(),
        )?;
        let discovery =
            match DiscoveryListener::start(&self.config, unreliable.advert(), self.queue.sender())
            {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!(
                        port = self.config.discovery_port,
                        error = %e,
                        "discovery port unavailable, host will not be discoverable"
                    );
                    self.queue.push(NetEvent::Warning(e));
                    None
                }
            };
        Ok(Transport::Host {
            registry,
            reliable,
            unreliable,
            discovery,
        })
    }

    /// Join the host at `host:port`. The unreliable port follows the
    /// configured pairing rule.
    pub fn start_client(&mut self, host: &str, port: u16) -> Result<ClientId, NetError> {
        let unreliable_port = self.config.unreliable_port_for(port);
        self.join_with_ports(host, port, unreliable_port)
    }

    /// Join a host found by discovery.
    pub fn join(&mut self, descriptor: &HostDescriptor) -> Result<ClientId, NetError> {
        self.join_with_ports(
            &descriptor.address,
            descriptor.reliable_port,
            descriptor.unreliable_port,
        )
    }

    fn join_with_ports(
        &mut self,
        host: &str,
        reliable_port: u16,
        unreliable_port: u16,
    ) -> Result<ClientId, NetError> {
        if !matches!(self.transport, Transport::Idle) {
            return Err(NetError::AlreadyRunning);
        }
        match self.bring_up_client(host, reliable_port, unreliable_port) {
            Ok(mut transport) => {
                let Transport::Client {
                    id,
                    reliable,
                    unreliable,
                } = &mut transport
                else {
                    return Err(NetError::NotRunning);
                };
                let id = *id;
                // Surface the connection before anything the host sent.
                self.queue.push(NetEvent::ClientConnected(id));
                reliable.start();
                unreliable.start();
                self.transport = transport;
                Ok(id)
            }
            Err(e) => Err(self.bring_up_failed(e)),
        }
    }

    fn bring_up_client(
        &self,
        host: &str,
        reliable_port: u16,
        unreliable_port: u16,
    ) -> Result<Transport, NetError> {
        self.config.validate()?;
        let server = resolve(host, reliable_port)?;
        let mut reliable = ReliableClient::connect(server, &self.config, self.queue.sender())?;
        let id = reliable.id();

        let unreliable_server = SocketAddr::new(server.ip(), unreliable_port);
        let unreliable = UnreliableClient::connect(unreliable_server, &self.config, self.queue.sender())
            .and_then(|unreliable| {
                unreliable.announce(id, self.config.announce_attempts)?;
                Ok(unreliable)
            });
        match unreliable {
            Ok(unreliable) => Ok(Transport::Client {
                id,
                reliable,
                unreliable,
            }),
            Err(e) => {
                reliable.abort();
                Err(e)
            }
        }
    }

    fn bring_up_failed(&self, e: NetError) -> NetError {
        error!(error = %e, "session bring-up failed");
        self.queue.push(NetEvent::ConnectionError(e.clone()));
        e
    }

    /// Send `message` to `target` on the message kind's default channel.
    pub fn send(&mut self, target: Target, message: Message) -> Result<(), NetError> {
        let channel = message.default_channel();
        self.send_on(channel, target, message)
    }

    /// Send on an explicit channel.
    ///
    /// Fails synchronously only when there is no session, when a unicast
    /// target is not registered (host side), or when the message cannot be
    /// encoded. Transport failures are queued as warnings instead.
    pub fn send_on(
        &mut self,
        channel: Channel,
        target: Target,
        message: Message,
    ) -> Result<(), NetError> {
        let result = match &self.transport {
            Transport::Idle => return Err(NetError::NotRunning),
            Transport::Host {
                reliable,
                unreliable,
                ..
            } => {
                let envelope = Envelope::new(ClientId::HOST, target, message);
                if route(ClientId::HOST, target, std::iter::empty()) == Route::Local {
                    self.queue.push(NetEvent::MessageReceived {
                        from: ClientId::HOST,
                        channel,
                        envelope,
                    });
                    return Ok(());
                }
                match channel {
                    Channel::Reliable => reliable.send_to(&envelope),
                    Channel::Unreliable => unreliable.send_to(&envelope),
                }
            }
            Transport::Client {
                id,
                reliable,
                unreliable,
            } => {
                let envelope = Envelope::new(*id, target, message);
                match channel {
                    Channel::Reliable => reliable.send(&envelope),
                    Channel::Unreliable => unreliable.send(&envelope),
                }
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e @ (NetError::NotRunning | NetError::TargetNotFound(_) | NetError::Encode(_))) => {
                Err(e)
            }
            Err(e) => {
                warn!(%channel, %target, error = %e, "send failed");
                self.queue.push(NetEvent::Warning(e));
                Ok(())
            }
        }
    }

    /// Look for hosts in the background. The result arrives as a
    /// `DiscoveryCompleted` event once the window closes; a failed probe is
    /// a warning followed by an empty result.
    pub fn discover(&self) -> Result<(), NetError> {
        let config = self.config.clone();
        let events = self.queue.sender();
        thread::Builder::new()
            .name("discovery".into())
            .spawn(move || {
                let hosts = match discover(&config) {
                    Ok(hosts) => hosts,
                    Err(e) => {
                        warn!(error = %e, "discovery failed");
                        let _ = events.send(NetEvent::Warning(e));
                        Vec::new()
                    }
                };
                let _ = events.send(NetEvent::DiscoveryCompleted(hosts));
            })?;
        Ok(())
    }

    /// Drain the event queue and dispatch every event to the handler.
    /// Returns how many events were dispatched. Never blocks on the network.
    pub fn tick(&mut self) -> usize {
        let events = self.queue.drain();
        let count = events.len();
        for event in events {
            self.dispatch(event);
        }
        count
    }

    fn dispatch(&mut self, event: NetEvent) {
        let lost_host = matches!(
            (&event, &self.transport),
            (NetEvent::ClientDisconnected(lost), Transport::Client { id, .. }) if lost == id
        );
        if lost_host {
            info!("lost connection to host");
            self.shutdown_transport();
        }

        let mut outbox = Outbox::default();
        match event {
            NetEvent::ClientConnected(id) => self.handler.client_connected(id, &mut outbox),
            NetEvent::ClientDisconnected(id) => self.handler.client_disconnected(id, &mut outbox),
            NetEvent::MessageReceived {
                from,
                channel,
                envelope,
            } => self
                .handler
                .message_received(from, channel, &envelope, &mut outbox),
            NetEvent::ConnectionError(e) => self.handler.connection_error(&e, &mut outbox),
            NetEvent::Warning(e) => self.handler.warning(&e),
            NetEvent::DiscoveryCompleted(hosts) => {
                self.handler.discovery_completed(&hosts, &mut outbox)
            }
            NetEvent::ServiceStopped(service) => {
                debug!(%service, "service stopped");
                self.handler.service_stopped(service);
            }
        }
        self.flush(outbox);
    }

    fn flush(&mut self, mut outbox: Outbox) {
        for outgoing in outbox.take() {
            let channel = outgoing
                .channel
                .unwrap_or_else(|| outgoing.message.default_channel());
            match self.send_on(channel, outgoing.target, outgoing.message) {
                Ok(()) => {}
                Err(NetError::NotRunning) => {
                    debug!(target = %outgoing.target, "dropping handler send, session closed");
                }
                Err(e) => {
                    warn!(target = %outgoing.target, error = %e, "handler send failed");
                    self.queue.push(NetEvent::Warning(e));
                }
            }
        }
    }

    /// Close the session. Every connection that closes reports
    /// `ClientDisconnected` to the handler before this returns. Does nothing
    /// when there is no session.
    pub fn disconnect(&mut self) {
        if matches!(self.transport, Transport::Idle) {
            return;
        }
        self.shutdown_transport();
        self.tick();
    }

    fn shutdown_transport(&mut self) {
        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Idle => {}
            Transport::Host {
                mut reliable,
                mut unreliable,
                discovery,
                ..
            } => {
                if let Some(mut discovery) = discovery {
                    discovery.stop();
                }
                unreliable.stop();
                reliable.stop();
                info!("host session closed");
            }
            Transport::Client {
                id,
                mut reliable,
                mut unreliable,
            } => {
                unreliable.close();
                reliable.close();
                info!(%id, "left session");
            }
        }
    }
}

impl<H: NetHandler> Drop for Session<H> {
    fn drop(&mut self) {
        self.shutdown_transport();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetError::Resolve(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| NetError::Resolve(format!("{host}:{port}: no addresses")))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpListener, UdpSocket};
    use std::time::{Duration, Instant};

    use lanparty_protocol::encode;

    use super::*;

    #[derive(Default)]
    struct Counts {
        errors: usize,
        connected: usize,
        disconnected: usize,
        messages: Vec<(ClientId, Envelope)>,
        order: Vec<&'static str>,
    }

    impl NetHandler for Counts {
        fn client_connected(&mut self, _id: ClientId, _outbox: &mut Outbox) {
            self.connected += 1;
            self.order.push("connected");
        }

        fn client_disconnected(&mut self, _id: ClientId, _outbox: &mut Outbox) {
            self.disconnected += 1;
        }

        fn message_received(
            &mut self,
            from: ClientId,
            _channel: Channel,
            envelope: &Envelope,
            outbox: &mut Outbox,
        ) {
            self.messages.push((from, envelope.clone()));
            self.order.push("message");
            if let Message::Chat { text } = &envelope.message
                && text == "ping"
            {
                outbox.send(Target::Server, Message::Chat { text: "pong".into() });
            }
        }

        fn connection_error(&mut self, _error: &NetError, _outbox: &mut Outbox) {
            self.errors += 1;
        }
    }

    fn test_config() -> NetConfig {
        NetConfig {
            bind_address: Ipv4Addr::LOCALHOST.into(),
            discovery_port: 0,
            poll_interval_ms: 10,
            connect_timeout_ms: 500,
            handshake_timeout_ms: 500,
            ..NetConfig::default()
        }
    }

    #[test]
    fn idle_session_rejects_send_and_ignores_disconnect() {
        let mut session = Session::new(test_config(), Counts::default());
        assert_eq!(session.role(), Role::None);
        assert!(matches!(
            session.send(Target::Broadcast, Message::Chat { text: "x".into() }),
            Err(NetError::NotRunning)
        ));
        session.disconnect();
        session.disconnect();
        assert_eq!(session.tick(), 0);
        assert_eq!(session.local_id(), None);
    }

    #[test]
    fn failed_join_reports_one_error_and_stays_idle() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut session = Session::new(test_config(), Counts::default());
        assert!(session.start_client("127.0.0.1", port).is_err());
        assert_eq!(session.role(), Role::None);
        session.tick();
        assert_eq!(session.handler().errors, 1);
        assert_eq!(session.handler().disconnected, 0);
    }

    #[test]
    fn joined_client_surfaces_before_host_records() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let descriptor = HostDescriptor {
            display_name: "burst".into(),
            address: "127.0.0.1".into(),
            reliable_port: listener.local_addr().unwrap().port(),
            unreliable_port: udp.local_addr().unwrap().port(),
            player_count: 0,
        };
        let host = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let chat = Envelope::new(
                ClientId::HOST,
                Target::Broadcast,
                Message::Chat { text: "hello".into() },
            );
            let mut burst = encode(&Envelope::registered(ClientId(2))).unwrap();
            burst.push(b'\n');
            burst.extend(encode(&chat).unwrap());
            burst.push(b'\n');
            stream.write_all(&burst).unwrap();
            stream
        });

        let mut session = Session::new(test_config(), Counts::default());
        assert_eq!(session.join(&descriptor).unwrap(), ClientId(2));
        let _host_stream = host.join().unwrap();

        let start = Instant::now();
        while session.handler().messages.is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "chat never arrived");
            session.tick();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(session.handler().order[..2], ["connected", "message"]);
        session.disconnect();
    }

    #[test]
    fn host_starts_once_and_delivers_to_itself() {
        let mut session = Session::new(test_config(), Counts::default());
        let ports = session.start_host(0).unwrap();
        assert_ne!(ports.reliable, 0);
        assert_ne!(ports.unreliable, 0);
        assert!(ports.discovery.is_some());
        assert_eq!(session.role(), Role::Host);
        assert_eq!(session.local_id(), Some(ClientId::HOST));
        assert!(session.is_ready());
        assert!(matches!(session.start_host(0), Err(NetError::AlreadyRunning)));

        session
            .send(Target::Server, Message::Chat { text: "ping".into() })
            .unwrap();
        session.tick();
        session.tick();
        let texts: Vec<_> = session
            .handler()
            .messages
            .iter()
            .map(|(from, env)| (*from, env.message.clone()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (ClientId::HOST, Message::Chat { text: "ping".into() }),
                (ClientId::HOST, Message::Chat { text: "pong".into() }),
            ]
        );

        assert!(matches!(
            session.send(Target::Client(ClientId(5)), Message::Chat { text: "?".into() }),
            Err(NetError::TargetNotFound(ClientId(5)))
        ));
        assert!(matches!(
            session.send(
                Target::Broadcast,
                Message::PositionUpdate {
                    x: f32::NAN,
                    y: 0.0
                }
            ),
            Err(NetError::Encode(_))
        ));

        session.disconnect();
        assert_eq!(session.role(), Role::None);
        assert!(session.host_ports().is_none());
    }

    #[test]
    fn resolve_rejects_garbage() {
        assert!(matches!(
            resolve("not a host name!", 80),
            Err(NetError::Resolve(_))
        ));
        assert_eq!(resolve("127.0.0.1", 80).unwrap().port(), 80);
    }
}
