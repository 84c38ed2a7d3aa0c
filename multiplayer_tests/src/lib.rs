// Test-only peer for multi-process session tests.
//
// Wraps the real `Session` (from `lanparty_net`) with a `Recorder` handler
// and synchronous polling helpers, so a test can play host and several
// clients on localhost from one thread: start, join, send, then block until
// an expected event shows up.
//
// The only test-specific code here is the recording handler and the
// blocking loops around `Session::tick()`. All networking uses the same code
// paths as a real application.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use lanparty_net::{
    HostPorts, NetConfig, NetError, NetEvent, NetHandler, Outbox, Service, Session,
};
use lanparty_protocol::{Channel, ClientId, Envelope, HostDescriptor, Message, Target};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Handler that records every event. It also answers `Chat { "ping" }` with
/// a unicast `Chat { "pong" }` to the sender, which exercises handler sends.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<NetEvent>,
}

impl NetHandler for Recorder {
    fn client_connected(&mut self, id: ClientId, _outbox: &mut Outbox) {
        self.events.push(NetEvent::ClientConnected(id));
    }

    fn client_disconnected(&mut self, id: ClientId, _outbox: &mut Outbox) {
        self.events.push(NetEvent::ClientDisconnected(id));
    }

    fn message_received(
        &mut self,
        from: ClientId,
        channel: Channel,
        envelope: &Envelope,
        outbox: &mut Outbox,
    ) {
        if envelope.message == (Message::Chat { text: "ping".into() }) {
            outbox.send(Target::Client(from), Message::Chat { text: "pong".into() });
        }
        self.events.push(NetEvent::MessageReceived {
            from,
            channel,
            envelope: envelope.clone(),
        });
    }

    fn connection_error(&mut self, error: &NetError, _outbox: &mut Outbox) {
        self.events.push(NetEvent::ConnectionError(error.clone()));
    }

    fn discovery_completed(&mut self, hosts: &[HostDescriptor], _outbox: &mut Outbox) {
        self.events.push(NetEvent::DiscoveryCompleted(hosts.to_vec()));
    }

    fn warning(&mut self, error: &NetError) {
        self.events.push(NetEvent::Warning(error.clone()));
    }

    fn service_stopped(&mut self, service: Service) {
        self.events.push(NetEvent::ServiceStopped(service));
    }
}

/// Loopback config with ephemeral ports and short timeouts.
pub fn test_config() -> NetConfig {
    NetConfig {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        discovery_target: Ipv4Addr::LOCALHOST.into(),
        discovery_port: 0,
        discovery_window_ms: 300,
        poll_interval_ms: 10,
        connect_timeout_ms: 2000,
        handshake_timeout_ms: 2000,
        display_name: "test-host".into(),
        ..NetConfig::default()
    }
}

/// A descriptor pointing at a host on loopback.
pub fn loopback_descriptor(ports: HostPorts) -> HostDescriptor {
    HostDescriptor {
        display_name: "test-host".into(),
        address: Ipv4Addr::LOCALHOST.to_string(),
        reliable_port: ports.reliable,
        unreliable_port: ports.unreliable,
        player_count: 0,
    }
}

/// A session plus a cursor into its recorded events.
pub struct TestPeer {
    pub session: Session<Recorder>,
    cursor: usize,
}

impl TestPeer {
    pub fn new(config: NetConfig) -> Self {
        Self {
            session: Session::new(config, Recorder::default()),
            cursor: 0,
        }
    }

    /// Start a host on free ports.
    pub fn host() -> (Self, HostPorts) {
        Self::host_with(test_config())
    }

    pub fn host_with(config: NetConfig) -> (Self, HostPorts) {
        let mut peer = Self::new(config);
        let ports = peer.session.start_host(0).expect("start_host failed");
        (peer, ports)
    }

    /// Join a loopback host and wait until its unreliable address is usable
    /// from this side (the client's `ClientConnected` has been dispatched).
    pub fn join(ports: HostPorts) -> Self {
        let mut peer = Self::new(test_config());
        peer.session
            .join(&loopback_descriptor(ports))
            .expect("join failed");
        let id = peer.id();
        peer.poll_until("own ClientConnected", |e| {
            matches!(e, NetEvent::ClientConnected(got) if *got == id)
        });
        peer
    }

    pub fn id(&self) -> ClientId {
        self.session.local_id().expect("session not running")
    }

    pub fn events(&self) -> &[NetEvent] {
        &self.session.handler().events
    }

    /// Tick until an event after the cursor matches, then move the cursor
    /// past it. Panics after `POLL_TIMEOUT`.
    pub fn poll_until(&mut self, what: &str, pred: impl Fn(&NetEvent) -> bool) -> NetEvent {
        let start = Instant::now();
        loop {
            self.session.tick();
            let events = &self.session.handler().events;
            if let Some(offset) = events[self.cursor..].iter().position(&pred) {
                let index = self.cursor + offset;
                self.cursor = index + 1;
                return events[index].clone();
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for a message matching `pred`; returns (from, channel, envelope).
    pub fn poll_message(
        &mut self,
        what: &str,
        pred: impl Fn(&Envelope) -> bool,
    ) -> (ClientId, Channel, Envelope) {
        match self.poll_until(what, |e| {
            matches!(e, NetEvent::MessageReceived { envelope, .. } if pred(envelope))
        }) {
            NetEvent::MessageReceived {
                from,
                channel,
                envelope,
            } => (from, channel, envelope),
            _ => unreachable!(),
        }
    }

    /// Tick for `duration` and return every event recorded meanwhile.
    pub fn poll_for(&mut self, duration: Duration) -> Vec<NetEvent> {
        let before = self.session.handler().events.len();
        let start = Instant::now();
        while start.elapsed() < duration {
            self.session.tick();
            thread::sleep(POLL_INTERVAL);
        }
        self.session.tick();
        self.session.handler().events[before..].to_vec()
    }

    /// Host only: block until `id` has announced its unreliable address.
    pub fn wait_bound(&self, id: ClientId) {
        let start = Instant::now();
        while self.session.unreliable_address(id).is_none() {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "client {id} never bound an unreliable address"
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn send(&mut self, target: Target, message: Message) {
        self.session.send(target, message).expect("send failed");
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
    }
}

/// Count recorded events matching `pred`.
pub fn count(events: &[NetEvent], pred: impl Fn(&NetEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
