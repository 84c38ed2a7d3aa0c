// Identity and addressing types for the session protocol.
//
// Every envelope carries a sender id and a target. Both are plain integers on
// the wire, but the reserved values carry meaning, so they are modeled as
// newtypes here:
//
// - `ClientId`: `0` is "not yet assigned" (a fresh client, a discovery
//   probe), `1` is the host, `2..` are clients assigned by the reliable
//   server in accept order.
// - `Target`: `0` is broadcast, `-1` is server-local (never forwarded), any
//   positive value is a unicast to that client id. Other negative values are
//   rejected at decode time.
//
// `Channel` names the two transports an envelope can travel over. It lives
// here (not in the net crate) so that `Message::default_channel` can be
// answered by the protocol crate alone.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-assigned client identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i32);

impl ClientId {
    /// Sender id of a client that has not been assigned an identity yet.
    pub const UNASSIGNED: ClientId = ClientId(0);
    /// The host's own identity.
    pub const HOST: ClientId = ClientId(1);
    /// First id handed out by the reliable server.
    pub const FIRST_ASSIGNED: ClientId = ClientId(2);

    /// True for ids the reliable server could have handed out.
    pub fn is_assigned(self) -> bool {
        self.0 >= Self::FIRST_ASSIGNED.0
    }

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw wire value for a broadcast target.
pub const BROADCAST_TARGET: i32 = 0;
/// Raw wire value for a server-local target.
pub const SERVER_TARGET: i32 = -1;

/// Where an envelope is addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Target {
    /// Every registered client except the sender.
    Broadcast,
    /// Consumed by the receiving server; never forwarded.
    Server,
    /// A single client (or the host, id 1).
    Client(ClientId),
}

impl Target {
    pub fn to_wire(self) -> i32 {
        match self {
            Target::Broadcast => BROADCAST_TARGET,
            Target::Server => SERVER_TARGET,
            Target::Client(id) => id.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Broadcast => f.write_str("broadcast"),
            Target::Server => f.write_str("server"),
            Target::Client(id) => write!(f, "client {id}"),
        }
    }
}

/// A target id that is neither broadcast, server, nor a positive client id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid target id {0}")]
pub struct InvalidTarget(pub i32);

impl TryFrom<i32> for Target {
    type Error = InvalidTarget;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            BROADCAST_TARGET => Ok(Target::Broadcast),
            SERVER_TARGET => Ok(Target::Server),
            id if id > 0 => Ok(Target::Client(ClientId(id))),
            other => Err(InvalidTarget(other)),
        }
    }
}

impl From<Target> for i32 {
    fn from(target: Target) -> Self {
        target.to_wire()
    }
}

impl From<ClientId> for Target {
    fn from(id: ClientId) -> Self {
        Target::Client(id)
    }
}

/// The transport an envelope travels over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered TCP stream, one envelope per line.
    Reliable,
    /// Best-effort UDP, one envelope per datagram.
    Unreliable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Reliable => f.write_str("reliable"),
            Channel::Unreliable => f.write_str("unreliable"),
        }
    }
}
