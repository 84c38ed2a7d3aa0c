// Integration smoke test for a hosted session.
//
// Starts a real host `Session` on localhost and drives it with mock clients
// built from plain sockets plus the protocol crate's codec and framing: the
// identity handshake, reliable routing (unicast, broadcast, server-local),
// unreliable address binding and relay, discovery on the unreliable port,
// and disconnect notices.
//
// The host side is the same code an application runs; only the clients are
// hand-rolled, so wire-level behaviour is checked independently of
// `ReliableClient` / `UnreliableClient`.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use lanparty_net::{NetConfig, NetError, NetEvent, NetHandler, Outbox, Session};
use lanparty_protocol::{
    Channel, ClientId, Envelope, Message, Target, decode, encode, read_frame, write_frame,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side handler that keeps every event for inspection.
#[derive(Default)]
struct Recorder {
    events: Vec<NetEvent>,
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
        _outbox: &mut Outbox,
    ) {
        self.events.push(NetEvent::MessageReceived {
            from,
            channel,
            envelope: envelope.clone(),
        });
    }

    fn warning(&mut self, error: &NetError) {
        self.events.push(NetEvent::Warning(error.clone()));
    }
}

fn host_config() -> NetConfig {
    NetConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        discovery_port: 0,
        poll_interval_ms: 10,
        display_name: "smoke-host".into(),
        ..NetConfig::default()
    }
}

/// Tick the host until `pred` matches an event recorded since `from_index`.
fn wait_host(
    host: &mut Session<Recorder>,
    from_index: usize,
    what: &str,
    pred: impl Fn(&NetEvent) -> bool,
) -> NetEvent {
    let start = Instant::now();
    loop {
        host.tick();
        if let Some(event) = host.handler().events[from_index..].iter().find(|e| pred(e)) {
            return event.clone();
        }
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A mock client speaking the wire protocol directly.
struct MockClient {
    id: ClientId,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    udp: UdpSocket,
}

impl MockClient {
    fn connect(reliable: SocketAddr) -> Self {
        let stream = TcpStream::connect(reliable).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let first = decode(&read_frame(&mut reader).unwrap().unwrap()).unwrap();
        let id = match (&first.message, first.target_id) {
            (Message::RegisteredClient { .. }, Target::Client(id)) => id,
            other => panic!("expected RegisteredClient, got {other:?}"),
        };
        assert_eq!(first.sender_id, ClientId::HOST);
        assert_eq!(first.message.presence_id(), Some(id));

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            id,
            reader,
            writer: stream,
            udp,
        }
    }

    fn send(&mut self, target: Target, message: Message) {
        let envelope = Envelope::new(self.id, target, message);
        write_frame(&mut self.writer, &encode(&envelope).unwrap()).unwrap();
    }

    fn recv(&mut self) -> Envelope {
        decode(&read_frame(&mut self.reader).unwrap().unwrap()).unwrap()
    }

    fn send_datagram(&self, to: SocketAddr, envelope: &Envelope) {
        self.udp.send_to(&encode(envelope).unwrap(), to).unwrap();
    }

    fn recv_datagram(&self) -> Envelope {
        let mut buf = [0u8; 4096];
        let (len, _) = self.udp.recv_from(&mut buf).unwrap();
        decode(&buf[..len]).unwrap()
    }
}

#[test]
fn full_session_lifecycle() {
    // 1. Host on free ports.
    let mut host = Session::new(host_config(), Recorder::default());
    let ports = host.start_host(0).unwrap();
    let reliable: SocketAddr = ([127, 0, 0, 1], ports.reliable).into();
    let unreliable: SocketAddr = ([127, 0, 0, 1], ports.unreliable).into();

    // 2. Two clients connect and get ids 2 and 3.
    let mut alice = MockClient::connect(reliable);
    let mut bob = MockClient::connect(reliable);
    assert_eq!(alice.id, ClientId(2));
    assert_eq!(bob.id, ClientId(3));
    wait_host(&mut host, 0, "bob connected", |e| {
        matches!(e, NetEvent::ClientConnected(ClientId(3)))
    });
    assert_eq!(host.connected_clients(), vec![ClientId(2), ClientId(3)]);

    // 3. Unicast Alice -> Bob. The host sees it too.
    alice.send(
        Target::Client(bob.id),
        Message::SpawnEvent {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            kind: "tree".into(),
        },
    );
    let got = bob.recv();
    assert_eq!(got.sender_id, alice.id);
    assert!(matches!(got.message, Message::SpawnEvent { ref kind, .. } if kind == "tree"));
    let mark = host.handler().events.len();
    wait_host(&mut host, 0, "spawn at host", |e| {
        matches!(e, NetEvent::MessageReceived { from: ClientId(2), channel: Channel::Reliable, .. })
    });

    // 4. Server-addressed message stays at the host.
    bob.send(Target::Server, Message::screen_size(800, 600));
    let event = wait_host(&mut host, mark, "screen size", |e| {
        matches!(e, NetEvent::MessageReceived { from: ClientId(3), .. })
    });
    if let NetEvent::MessageReceived { envelope, .. } = event {
        assert_eq!(envelope.message.parse_screen_size(), Some((800, 600)));
        assert_eq!(envelope.target_id, Target::Server);
    }

    // 5. Unicast to a missing id: warning, connection stays up.
    let mark = host.handler().events.len();
    alice.send(Target::Client(ClientId(42)), Message::Chat { text: "hello?".into() });
    wait_host(&mut host, mark, "target not found", |e| {
        matches!(e, NetEvent::Warning(NetError::TargetNotFound(ClientId(42))))
    });

    // 6. Broadcast from Bob reaches Alice but not Bob. Bob's next line is
    //    the host's own broadcast, proving nothing was echoed back.
    bob.send(Target::Broadcast, Message::Chat { text: "hi all".into() });
    assert_eq!(alice.recv().message, Message::Chat { text: "hi all".into() });
    host.send(Target::Broadcast, Message::Chat { text: "from host".into() })
        .unwrap();
    assert_eq!(bob.recv().message, Message::Chat { text: "from host".into() });
    assert_eq!(alice.recv().message, Message::Chat { text: "from host".into() });

    // 7. Malformed line is dropped; the stream keeps working.
    let mark = host.handler().events.len();
    alice.writer.write_all(b"{\"type\":\"PositionUpdate\"\n").unwrap();
    alice.send(Target::Server, Message::Chat { text: "after junk".into() });
    wait_host(&mut host, mark, "decode warning", |e| {
        matches!(e, NetEvent::Warning(NetError::Decode(_)))
    });
    wait_host(&mut host, mark, "message after junk", |e| {
        matches!(e, NetEvent::MessageReceived { envelope, .. }
            if envelope.message == Message::Chat { text: "after junk".into() })
    });

    // 8. Before Bob announces, a UDP unicast to him is dropped and reported.
    let mark = host.handler().events.len();
    host.send(Target::Client(bob.id), Message::PositionUpdate { x: 0.0, y: 0.0 })
        .unwrap();
    wait_host(&mut host, mark, "unbound warning", |e| {
        matches!(e, NetEvent::Warning(NetError::UnboundAddress(ClientId(3))))
    });

    // 9. Both announce; position updates relay over UDP.
    alice.send_datagram(unreliable, &Envelope::unreliable_announce(alice.id));
    bob.send_datagram(unreliable, &Envelope::unreliable_announce(bob.id));
    let start = Instant::now();
    while host.unreliable_address(alice.id).is_none() || host.unreliable_address(bob.id).is_none() {
        assert!(start.elapsed() < TIMEOUT, "announcements never bound");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        host.unreliable_address(bob.id),
        Some(bob.udp.local_addr().unwrap())
    );
    let update = Envelope::new(
        alice.id,
        Target::Broadcast,
        Message::PositionUpdate { x: 5.0, y: 6.0 },
    );
    alice.send_datagram(unreliable, &update);
    assert_eq!(bob.recv_datagram(), update);

    host.send(Target::Client(alice.id), Message::PositionUpdate { x: 7.0, y: 8.0 })
        .unwrap();
    let got = alice.recv_datagram();
    assert_eq!(got.sender_id, ClientId::HOST);
    assert_eq!(got.message, Message::PositionUpdate { x: 7.0, y: 8.0 });

    // 10. A probe on the unreliable port gets the descriptor (host + 2).
    alice.send_datagram(unreliable, &Envelope::discovery_probe());
    match alice.recv_datagram().message {
        Message::HostDescriptor(d) => {
            assert_eq!(d.display_name, "smoke-host");
            assert_eq!(d.reliable_port, ports.reliable);
            assert_eq!(d.unreliable_port, ports.unreliable);
            assert_eq!(d.player_count, 3);
        }
        other => panic!("expected HostDescriptor, got {other:?}"),
    }

    // 11. Alice leaves: one ClientDisconnected, Bob gets the notice.
    let mark = host.handler().events.len();
    drop(alice);
    wait_host(&mut host, mark, "alice disconnected", |e| {
        matches!(e, NetEvent::ClientDisconnected(ClientId(2)))
    });
    let notice = bob.recv();
    assert!(matches!(notice.message, Message::DisconnectedClient { .. }));
    assert_eq!(notice.message.presence_id(), Some(ClientId(2)));
    assert_eq!(host.connected_clients(), vec![ClientId(3)]);

    // 12. Host shuts down: Bob's stream ends, exactly one disconnect each.
    host.disconnect();
    host.disconnect();
    assert!(read_frame(&mut bob.reader).map(|f| f.is_none()).unwrap_or(true));
    let disconnects: Vec<_> = host.handler().events[mark..]
        .iter()
        .filter_map(|e| match e {
            NetEvent::ClientDisconnected(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects, vec![ClientId(2), ClientId(3)]);
}

#[test]
fn concurrent_connects_get_distinct_ids() {
    let mut host = Session::new(host_config(), Recorder::default());
    let ports = host.start_host(0).unwrap();
    let reliable: SocketAddr = ([127, 0, 0, 1], ports.reliable).into();

    let joiners: Vec<_> = (0..4)
        .map(|_| thread::spawn(move || MockClient::connect(reliable)))
        .collect();
    let clients: Vec<MockClient> = joiners.into_iter().map(|j| j.join().unwrap()).collect();

    let mut ids: Vec<i32> = clients.iter().map(|c| c.id.0).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|&id| id >= 2));

    let start = Instant::now();
    while host.connected_clients().len() < 4 {
        assert!(start.elapsed() < TIMEOUT);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(host.connected_clients().len(), 4);
}
