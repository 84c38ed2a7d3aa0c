// lanparty_protocol: wire protocol for LAN party sessions.
//
// This crate defines the envelope, its addressing rules, the codec, and the
// line framing shared by the host and by clients. It has no networking code
// of its own; `lanparty_net` drives sockets with it.
//
// Module overview:
// - `types.rs`:    `ClientId` (reserved 0/1, assigned from 2), `Target`
//                  (broadcast / server-local / unicast) and `Channel`.
// - `message.rs`:  `Envelope`, the closed `Message` enum (one variant per wire
//                  tag) and `HostDescriptor`.
// - `codec.rs`:    `encode` / `decode` between envelopes and newline-free
//                  JSON records.
// - `framing.rs`:  One-record-per-line framing over any `BufRead`/`Write`.
// - `routing.rs`:  `route`, the pure addressing decision over a snapshot of
//                  registered ids.
//
// Design decisions:
// - **JSON records.** Human readable, self-delimiting on a line, and small
//   enough for a single datagram.
// - **Tags as an enum.** The `type` tag and `payload` are one adjacently
//   tagged enum, so an unknown tag or a mismatched payload is a decode error
//   instead of a runtime branch.
// - **No async runtime.** Framing works on `std::io` traits so blocking
//   sockets and in-memory buffers share one code path.

pub mod codec;
pub mod framing;
pub mod message;
pub mod routing;
pub mod types;

pub use codec::{DecodeError, EncodeError, MAX_RECORD_SIZE, decode, encode};
pub use framing::{read_frame, write_frame};
pub use message::{Envelope, HostDescriptor, Message};
pub use routing::{Route, route};
pub use types::{Channel, ClientId, InvalidTarget, Target};
