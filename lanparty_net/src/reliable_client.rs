// Reliable (TCP) client: the joining side of the stream channel.
//
// `connect()` does the blocking part on the calling thread: TCP connect
// with a timeout, then wait (with a read timeout) for the host's
// `RegisteredClient` record, which carries this client's id. Only then is
// the background reader spawned, so a failed connect leaves nothing behind.
//
// The reader stays parked until `start()`, so nothing the host sends right
// after registration reaches the queue before the owner has surfaced the
// connection. Bytes that arrive meanwhile wait in the reader's buffer. A
// client closed before `start()` reports nothing.
//
// Once started, the reader queues every decoded envelope as
// `MessageReceived` and never calls back into the application. However it
// ends (host closed the stream, read error, or a local `close()`), it emits
// exactly one `ClientDisconnected(own id)`. `abort()` closes without that
// event.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use lanparty_protocol::{
    Channel, ClientId, Envelope, Message, Target, decode, encode, read_frame, write_frame,
};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::error::{NetError, is_timeout};
use crate::event::NetEvent;
use crate::registry::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

pub struct ReliableClient {
    id: ClientId,
    server: SocketAddr,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    connected: Arc<AtomicBool>,
    /// When set, the reader exits without reporting a disconnect.
    silent: Arc<AtomicBool>,
    /// Releases the parked reader. `None` once started or closed.
    gate: Option<Sender<()>>,
    reader_thread: Option<JoinHandle<()>>,
}

impl ReliableClient {
    /// Connect to a host and wait for its identity assignment.
    pub fn connect(
        server: SocketAddr,
        config: &NetConfig,
        events: Sender<NetEvent>,
    ) -> Result<Self, NetError> {
        let stream = TcpStream::connect_timeout(&server, config.connect_timeout())?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.handshake_timeout()))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let id = match read_registration(&mut reader) {
            Ok(id) => id,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(e);
            }
        };
        // The long-lived reader blocks until data or shutdown.
        stream.set_read_timeout(None)?;
        let writer = Mutex::new(BufWriter::new(stream.try_clone()?));

        let connected = Arc::new(AtomicBool::new(true));
        let silent = Arc::new(AtomicBool::new(false));
        let (gate, parked) = mpsc::channel();
        let reader_connected = connected.clone();
        let reader_silent = silent.clone();
        let reader_thread = thread::Builder::new()
            .name(format!("reliable-client-{id}"))
            .spawn(move || {
                reader_loop(reader, id, parked, reader_connected, reader_silent, events)
            })?;

        info!(%id, %server, "joined session");
        Ok(Self {
            id,
            server,
            stream,
            writer,
            connected,
            silent,
            gate: Some(gate),
            reader_thread: Some(reader_thread),
        })
    }

    /// Let the reader deliver. Calling this more than once is harmless.
    pub fn start(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    /// The id the host assigned during the handshake.
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Write one envelope as a single line.
    pub fn send(&self, envelope: &Envelope) -> Result<(), NetError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(NetError::NotRunning);
        }
        let record = encode(envelope)?;
        let mut writer = lock(&self.writer);
        write_frame(&mut *writer, &record)?;
        Ok(())
    }

    /// Close the connection and wait for the reader, which reports the
    /// disconnect if it was started. Calling this more than once is harmless.
    pub fn close(&mut self) {
        let Some(reader_thread) = self.reader_thread.take() else {
            return;
        };
        // Dropping an unused gate tells the parked reader to exit quietly.
        self.gate = None;
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = reader_thread.join();
        debug!(id = %self.id, "reliable client closed");
    }

    /// Close without emitting `ClientDisconnected`.
    pub fn abort(&mut self) {
        self.silent.store(true, Ordering::SeqCst);
        self.close();
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read the host's first record and extract the assigned id.
fn read_registration(reader: &mut BufReader<TcpStream>) -> Result<ClientId, NetError> {
    let record = match read_frame(reader) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Err(NetError::Handshake(
                "connection closed before registration".into(),
            ));
        }
        Err(e) if is_timeout(&e) => {
            return Err(NetError::Handshake("timed out waiting for registration".into()));
        }
        Err(e) => return Err(e.into()),
    };
    let envelope = decode(&record)?;
    match (&envelope.message, envelope.target_id) {
        (Message::RegisteredClient { .. }, Target::Client(id))
            if id.is_assigned() && envelope.message.presence_id() == Some(id) =>
        {
            Ok(id)
        }
        _ => Err(NetError::Handshake(format!(
            "expected RegisteredClient, got {} for {}",
            envelope.message.tag(),
            envelope.target_id
        ))),
    }
}

fn reader_loop(
    mut reader: BufReader<TcpStream>,
    id: ClientId,
    parked: Receiver<()>,
    connected: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
    events: Sender<NetEvent>,
) {
    if parked.recv().is_err() {
        connected.store(false, Ordering::SeqCst);
        debug!(%id, "reliable client closed before start");
        return;
    }
    loop {
        match read_frame(&mut reader) {
            Ok(Some(record)) => match decode(&record) {
                Ok(envelope) => {
                    let _ = events.send(NetEvent::MessageReceived {
                        from: envelope.sender_id,
                        channel: Channel::Reliable,
                        envelope,
                    });
                }
                Err(e) => {
                    warn!(%id, error = %e, "dropping malformed record from host");
                    let _ = events.send(NetEvent::Warning(e.into()));
                }
            },
            Ok(None) => {
                info!(%id, "reliable connection closed");
                break;
            }
            Err(e) => {
                if !silent.load(Ordering::SeqCst) {
                    debug!(%id, error = %e, "reliable read ended");
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    if !silent.load(Ordering::SeqCst) {
        let _ = events.send(NetEvent::ClientDisconnected(id));
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn test_config() -> NetConfig {
        NetConfig {
            handshake_timeout_ms: 200,
            connect_timeout_ms: 1000,
            ..NetConfig::default()
        }
    }

    /// Accept one connection and greet it with `first`.
    fn fake_host(first: Envelope) -> (SocketAddr, JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            write_frame(&mut stream, &encode(&first).unwrap()).unwrap();
            stream
        });
        (addr, handle)
    }

    #[test]
    fn handshake_assigns_id_and_messages_are_queued() {
        let (addr, host) = fake_host(Envelope::registered(ClientId(5)));
        let (tx, rx) = mpsc::channel();
        let mut client = ReliableClient::connect(addr, &test_config(), tx).unwrap();
        client.start();
        assert_eq!(client.id(), ClientId(5));
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut host_stream = host.join().unwrap();
        let chat = Envelope::new(
            ClientId::HOST,
            Target::Broadcast,
            Message::Chat { text: "welcome".into() },
        );
        write_frame(&mut host_stream, &encode(&chat).unwrap()).unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            NetEvent::MessageReceived { from, channel, envelope } => {
                assert_eq!(from, ClientId::HOST);
                assert_eq!(channel, Channel::Reliable);
                assert_eq!(envelope, chat);
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }

        client.close();
        client.close();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NetEvent::ClientDisconnected(ClientId(5))));
        assert!(matches!(
            client.send(&chat),
            Err(NetError::NotRunning)
        ));
    }

    #[test]
    fn wrong_first_message_fails_handshake() {
        let (addr, _host) = fake_host(Envelope::departed(ClientId(5)));
        let (tx, rx) = mpsc::channel();
        let result = ReliableClient::connect(addr, &test_config(), tx);
        assert!(matches!(result, Err(NetError::Handshake(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn silent_host_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, _rx) = mpsc::channel();
        let result = ReliableClient::connect(listener.local_addr().unwrap(), &test_config(), tx);
        assert!(matches!(result, Err(NetError::Handshake(_))));
    }

    #[test]
    fn refused_connect_is_io_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            ReliableClient::connect(addr, &test_config(), tx),
            Err(NetError::Io(_))
        ));
    }

    #[test]
    fn host_closing_reports_one_disconnect() {
        let (addr, host) = fake_host(Envelope::registered(ClientId(2)));
        let (tx, rx) = mpsc::channel();
        let mut client = ReliableClient::connect(addr, &test_config(), tx).unwrap();
        client.start();
        drop(host.join().unwrap());

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            NetEvent::ClientDisconnected(ClientId(2))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        drop(client);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn abort_is_silent() {
        let (addr, _host) = fake_host(Envelope::registered(ClientId(3)));
        let (tx, rx) = mpsc::channel();
        let mut client = ReliableClient::connect(addr, &test_config(), tx).unwrap();
        client.abort();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn records_behind_registration_wait_for_start() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let chat = Envelope::new(
            ClientId::HOST,
            Target::Broadcast,
            Message::Chat { text: "early".into() },
        );
        let sent = chat.clone();
        let host = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Both records in one write, so they land in the same read.
            let mut burst = encode(&Envelope::registered(ClientId(8))).unwrap();
            burst.push(b'\n');
            burst.extend(encode(&sent).unwrap());
            burst.push(b'\n');
            std::io::Write::write_all(&mut stream, &burst).unwrap();
            stream
        });

        let (tx, rx) = mpsc::channel();
        let mut client = ReliableClient::connect(addr, &test_config(), tx).unwrap();
        let _host_stream = host.join().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        client.start();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            NetEvent::MessageReceived { envelope, .. } => assert_eq!(envelope, chat),
            other => panic!("expected MessageReceived, got {other:?}"),
        }
    }

    #[test]
    fn close_before_start_is_silent() {
        let (addr, host) = fake_host(Envelope::registered(ClientId(4)));
        let (tx, rx) = mpsc::channel();
        let mut client = ReliableClient::connect(addr, &test_config(), tx).unwrap();
        let mut host_stream = host.join().unwrap();
        let chat = Envelope::new(
            ClientId::HOST,
            Target::Broadcast,
            Message::Chat { text: "never seen".into() },
        );
        write_frame(&mut host_stream, &encode(&chat).unwrap()).unwrap();

        client.close();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }
}
