//! Agent-side error kinds (`spec §7`), layered over the shared wire-level
//! [`tunnel_protocol::ProtocolError`].

use thiserror::Error;
use tunnel_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("local connection refused")]
    LocalConnectRefused,

    #[error("local i/o error: {0}")]
    LocalIoError(std::io::Error),

    #[error("peer i/o error: {0}")]
    PeerIoError(std::io::Error),

    #[error("data channel authentication failed")]
    DataChannelAuthFailed,

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("reconnect attempts exhausted")]
    MaxReconnectAttemptsReached,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type AgentResult<T> = Result<T, AgentError>;
