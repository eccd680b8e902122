//! Wire-level error kinds shared by both peers.
//!
//! Per-side error kinds (`InvalidToken`, `LocalConnectRefused`, ...) live in
//! `tunnel-relay`/`tunnel-agent` and layer over this one with `#[from]`.

use thiserror::Error;

/// Errors that can occur decoding or encoding the control/data wire
/// formats, independent of which peer is doing the decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    #[error("unknown control message type: {0}")]
    UnknownMessageType(String),

    #[error("request {0} timed out waiting for a response")]
    RequestTimeout(crate::ids::RequestId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
