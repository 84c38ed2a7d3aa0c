// Error type for the transport crate.
//
// `NetError` is `Clone` so the same value can be handed back to a caller and
// also queued as a `NetEvent` for the main-thread handler; the non-`Clone`
// sources (`io::Error`, codec errors) are held behind `Arc`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use lanparty_protocol::{ClientId, DecodeError, EncodeError};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
    #[error("malformed envelope: {0}")]
    Decode(Arc<DecodeError>),
    #[error("cannot encode envelope: {0}")]
    Encode(Arc<EncodeError>),
    #[error("session is not running")]
    NotRunning,
    #[error("session is already running")]
    AlreadyRunning,
    #[error("target client {0} not found")]
    TargetNotFound(ClientId),
    #[error("client {0} has no unreliable address bound")]
    UnboundAddress(ClientId),
    #[error("no reliable session for client {0}")]
    UnknownSession(ClientId),
    #[error("client {id} is already bound to {bound}, ignoring {offered}")]
    AddressConflict {
        id: ClientId,
        bound: SocketAddr,
        offered: SocketAddr,
    },
    #[error("client {0} is already registered")]
    DuplicateClient(ClientId),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("invalid config: {0}")]
    Config(String),
}

/// True for I/O errors that only mean "nothing arrived yet" on a socket with
/// a read timeout.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::Io(Arc::new(err))
    }
}

impl From<DecodeError> for NetError {
    fn from(err: DecodeError) -> Self {
        NetError::Decode(Arc::new(err))
    }
}

impl From<EncodeError> for NetError {
    fn from(err: EncodeError) -> Self {
        NetError::Encode(Arc::new(err))
    }
}
