// Events, the event queue, and the handler trait.
//
// Every background loop (accept, reliable readers, the unreliable receive
// loop, discovery) reports through one `mpsc` channel of `NetEvent`s. The
// owning `Session` drains it from the main context on each `tick()` and
// dispatches to the application's `NetHandler`; nothing in a background
// thread ever calls application code directly.
//
// Handlers get an `Outbox` instead of the session itself, since the session
// is mutably borrowed during dispatch. Sends queued there are flushed by the
// session after each event.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

use lanparty_protocol::{Channel, ClientId, Envelope, HostDescriptor, Message, Target};

use crate::error::NetError;

/// Something that happened on the network, queued for the main context.
#[derive(Clone, Debug)]
pub enum NetEvent {
    /// A peer joined (host side) or this client finished bring-up.
    ClientConnected(ClientId),
    /// A peer left (host side) or this client lost its reliable connection.
    ClientDisconnected(ClientId),
    MessageReceived {
        /// Reliable-path messages on the host carry the connection's id;
        /// elsewhere this is the envelope's sender.
        from: ClientId,
        channel: Channel,
        envelope: Envelope,
    },
    /// A fatal failure: bring-up failed or a loop died unexpectedly.
    ConnectionError(NetError),
    /// A non-fatal problem: a dropped record, a failed send, a bind conflict.
    Warning(NetError),
    DiscoveryCompleted(Vec<HostDescriptor>),
    /// Terminal event of a long-lived loop other than a reliable reader
    /// (whose terminal event is `ClientDisconnected`).
    ServiceStopped(Service),
}

/// The background loops that report a `ServiceStopped` when they exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    ReliableAccept,
    UnreliableReceive,
    DiscoveryListener,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::ReliableAccept => f.write_str("reliable accept loop"),
            Service::UnreliableReceive => f.write_str("unreliable receive loop"),
            Service::DiscoveryListener => f.write_str("discovery listener"),
        }
    }
}

/// The multi-producer, single-consumer queue between the background loops
/// and the main context.
pub struct EventQueue {
    tx: Sender<NetEvent>,
    rx: Receiver<NetEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    /// A producer handle for a background loop.
    pub fn sender(&self) -> Sender<NetEvent> {
        self.tx.clone()
    }

    pub fn push(&self, event: NetEvent) {
        // The receiver lives in `self`, so this cannot fail.
        let _ = self.tx.send(event);
    }

    /// Everything queued so far. Never blocks.
    pub fn drain(&self) -> Vec<NetEvent> {
        self.rx.try_iter().collect()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A send requested from inside a handler callback.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    /// `None` picks the message's default channel.
    pub channel: Option<Channel>,
    pub target: Target,
    pub message: Message,
}

/// Sends buffered during dispatch, flushed by the session afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<OutgoingMessage>,
}

impl Outbox {
    pub fn send(&mut self, target: Target, message: Message) {
        self.pending.push(OutgoingMessage {
            channel: None,
            target,
            message,
        });
    }

    pub fn send_on(&mut self, channel: Channel, target: Target, message: Message) {
        self.pending.push(OutgoingMessage {
            channel: Some(channel),
            target,
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.pending)
    }
}

/// Application callbacks, all invoked on the thread that calls
/// `Session::tick`. Every method defaults to doing nothing.
pub trait NetHandler {
    fn client_connected(&mut self, _id: ClientId, _outbox: &mut Outbox) {}

    fn client_disconnected(&mut self, _id: ClientId, _outbox: &mut Outbox) {}

    fn message_received(
        &mut self,
        _from: ClientId,
        _channel: Channel,
        _envelope: &Envelope,
        _outbox: &mut Outbox,
    ) {
    }

    fn connection_error(&mut self, _error: &NetError, _outbox: &mut Outbox) {}

    fn discovery_completed(&mut self, _hosts: &[HostDescriptor], _outbox: &mut Outbox) {}

    fn warning(&mut self, _error: &NetError) {}

    fn service_stopped(&mut self, _service: Service) {}
}

impl NetHandler for () {}
