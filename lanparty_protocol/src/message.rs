// Envelope and message vocabulary.
//
// `Envelope` is the only structure that crosses process boundaries. It is
// `{ type, senderId, targetId, payload }` on the wire, where `type` selects
// the payload shape. On the Rust side the `type`/`payload` pair is a single
// `Message` enum (adjacently tagged), flattened into the envelope, so the
// closed set of tags is checked by serde at decode time rather than by
// string comparisons in the receive loops.
//
// Each message kind has a default transport (`Message::default_channel`):
// high-rate position updates and the control datagrams ride the unreliable
// channel, everything that must arrive (presence, spawns, chat) rides the
// reliable one.

use serde::{Deserialize, Serialize};

use crate::types::{Channel, ClientId, Target};

/// A routed, typed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_id: ClientId,
    pub target_id: Target,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: ClientId, target_id: Target, message: Message) -> Self {
        Self {
            sender_id,
            target_id,
            message,
        }
    }

    /// Broadcast discovery probe sent before the client has any identity.
    pub fn discovery_probe() -> Self {
        Self::new(ClientId::UNASSIGNED, Target::Server, Message::DiscoveryRequest)
    }

    /// Identity confirmation the host sends to a freshly accepted client.
    pub fn registered(id: ClientId) -> Self {
        Self::new(
            ClientId::HOST,
            Target::Client(id),
            Message::RegisteredClient {
                text: id.to_string(),
            },
        )
    }

    /// Departure notice broadcast by the host when a client goes away.
    pub fn departed(id: ClientId) -> Self {
        Self::new(
            ClientId::HOST,
            Target::Broadcast,
            Message::DisconnectedClient {
                text: id.to_string(),
            },
        )
    }

    /// Reply to a discovery probe. The prober has no identity yet, so the
    /// target is left at the wire default (0); the reply is unicast at the
    /// socket level regardless.
    pub fn host_reply(descriptor: HostDescriptor) -> Self {
        Self::new(
            ClientId::HOST,
            Target::Broadcast,
            Message::HostDescriptor(descriptor),
        )
    }

    /// Unreliable-address announcement. The sender id is the identity being
    /// bound to the datagram's source address.
    pub fn unreliable_announce(id: ClientId) -> Self {
        Self::new(id, Target::Server, Message::UnreliableConnectRequest)
    }
}

/// Payload variants, one per wire `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Broadcast probe looking for hosts.
    DiscoveryRequest,
    /// Reply to a probe.
    HostDescriptor(HostDescriptor),
    /// Confirms the identity assigned to the receiving client.
    RegisteredClient { text: String },
    /// Announces that a client left the session.
    DisconnectedClient { text: String },
    /// Binds the datagram source address to `senderId`.
    UnreliableConnectRequest,
    PositionUpdate { x: f32, y: f32 },
    SpawnEvent { x: f32, y: f32, z: f32, kind: String },
    /// Screen dimensions as `"WxH"`.
    ScreenSize { text: String },
    Chat { text: String },
}

impl Message {
    /// Wire tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::DiscoveryRequest => "DiscoveryRequest",
            Message::HostDescriptor(_) => "HostDescriptor",
            Message::RegisteredClient { .. } => "RegisteredClient",
            Message::DisconnectedClient { .. } => "DisconnectedClient",
            Message::UnreliableConnectRequest => "UnreliableConnectRequest",
            Message::PositionUpdate { .. } => "PositionUpdate",
            Message::SpawnEvent { .. } => "SpawnEvent",
            Message::ScreenSize { .. } => "ScreenSize",
            Message::Chat { .. } => "Chat",
        }
    }

    /// The transport this kind of message normally travels over.
    pub fn default_channel(&self) -> Channel {
        match self {
            Message::DiscoveryRequest
            | Message::HostDescriptor(_)
            | Message::UnreliableConnectRequest
            | Message::PositionUpdate { .. } => Channel::Unreliable,
            Message::RegisteredClient { .. }
            | Message::DisconnectedClient { .. }
            | Message::SpawnEvent { .. }
            | Message::ScreenSize { .. }
            | Message::Chat { .. } => Channel::Reliable,
        }
    }

    /// Control messages are consumed by the transport and never surface to
    /// the application on the host side.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::DiscoveryRequest
                | Message::HostDescriptor(_)
                | Message::UnreliableConnectRequest
        )
    }

    pub fn screen_size(width: u32, height: u32) -> Self {
        Message::ScreenSize {
            text: format!("{width}x{height}"),
        }
    }

    /// Parse a `ScreenSize` payload back into `(width, height)`. Returns
    /// `None` for other variants or a malformed `"WxH"` string.
    pub fn parse_screen_size(&self) -> Option<(u32, u32)> {
        let Message::ScreenSize { text } = self else {
            return None;
        };
        let (w, h) = text.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    /// False if any coordinate is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            Message::PositionUpdate { x, y } => x.is_finite() && y.is_finite(),
            Message::SpawnEvent { x, y, z, .. } => {
                x.is_finite() && y.is_finite() && z.is_finite()
            }
            _ => true,
        }
    }

    /// The client id carried by `RegisteredClient` / `DisconnectedClient`.
    pub fn presence_id(&self) -> Option<ClientId> {
        match self {
            Message::RegisteredClient { text } | Message::DisconnectedClient { text } => {
                text.trim().parse().ok().map(ClientId)
            }
            _ => None,
        }
    }
}

/// What a host advertises in reply to a discovery probe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDescriptor {
    pub display_name: String,
    /// Host address as seen by the host. Empty or unspecified addresses are
    /// replaced by the reply's source address on the discovering side.
    pub address: String,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    pub player_count: u32,
}
