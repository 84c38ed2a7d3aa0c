// lanparty_net: LAN session transport.
//
// A host runs a reliable TCP server and an unreliable UDP server side by
// side and answers discovery probes; clients find hosts by UDP broadcast,
// join over TCP to get an id, then announce their UDP address under that id.
// All network activity runs on background threads that report through one
// event queue; the application drains it from its own loop with
// `Session::tick`.
//
// Module overview:
// - `session.rs`:           `Session`, the orchestrator: roles, bring-up and
//                           teardown, sends, tick/dispatch.
// - `event.rs`:             `NetEvent`, the MPSC `EventQueue`, the
//                           `NetHandler` callbacks and their `Outbox`.
// - `registry.rs`:          `SessionRegistry` of connected clients and the
//                           per-connection `ConnectionHandle` writer.
// - `reliable_server.rs`:   TCP accept loop and one reader thread per client.
// - `reliable_client.rs`:   TCP connect, identity handshake, reader thread.
// - `unreliable_server.rs`: UDP receive loop: probes, address binding,
//                           routing by bound address.
// - `unreliable_client.rs`: Connected UDP socket and its receive loop.
// - `discovery.rs`:         Probe broadcast and the host-side listener.
// - `config.rs`:            `NetConfig`, TOML loading, defaults.
// - `error.rs`:             `NetError`.
//
// Dependencies: `lanparty_protocol` for the envelope, codec, framing and
// routing policy; `tracing` for logs. No async runtime: `std::net` with a
// thread per blocking loop, cancelled by polling an `AtomicBool`.
//
// The `lanparty` binary (`main.rs`) wraps `Session` in a small CLI.

pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod registry;
pub mod reliable_client;
pub mod reliable_server;
pub mod session;
pub mod unreliable_client;
pub mod unreliable_server;

pub use config::NetConfig;
pub use discovery::{DiscoveryListener, HostAdvert, discover};
pub use error::NetError;
pub use event::{EventQueue, NetEvent, NetHandler, Outbox, OutgoingMessage, Service};
pub use registry::{ConnectionHandle, SessionEntry, SessionRegistry};
pub use reliable_client::{ConnectionState, ReliableClient};
pub use reliable_server::ReliableServer;
pub use session::{HostPorts, Role, Session};
pub use unreliable_client::UnreliableClient;
pub use unreliable_server::UnreliableServer;
