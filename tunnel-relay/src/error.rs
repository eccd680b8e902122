//! Relay-side error kinds (`spec §7`), layered over the shared wire-level
//! [`tunnel_protocol::ProtocolError`].

use thiserror::Error;
use tunnel_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid token")]
    InvalidToken,

    #[error("empty token")]
    EmptyToken,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("port {0} is out of the allowed [1024, 65535] range")]
    PortOutOfRange(u16),

    #[error("port {0} is already registered to another agent")]
    PortAlreadyRegistered(u16),

    #[error("port {0} is not registered")]
    UnknownPort(u16),

    #[error("data channel authentication failed")]
    DataChannelAuthFailed,

    #[error("agent has no active data channel")]
    NoDataChannel,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
