//! # tunnel-protocol
//!
//! Wire codecs and shared types for the tunnel relay/agent engine: the
//! length-prefixed TCP data-channel frame format, the UDP datagram frame
//! formats, the JSON control-message envelope, and the opaque identifiers
//! that tie them together. Used by both `tunnel-relay` and `tunnel-agent`
//! so the two peers can never drift apart on wire format.

pub mod control;
pub mod error;
pub mod frame;
pub mod ids;
pub mod pending;
pub mod udp;

pub use control::{ControlBody, ControlMessage, MessageType};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{AgentId, ExternalConnId, RequestId, ID_WIRE_LEN};
pub use pending::PendingRequests;

/// Default deadline for a pending control request (`§4.2`).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Default agent heartbeat interval (`§4.6`).
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Default relay-side session timeout since the last heartbeat (`§4.4`, `§5`).
pub const SESSION_HEARTBEAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Default period of the relay's heartbeat sweeper (`§4.4`).
pub const HEARTBEAT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Inactivity timeout for a UDP NAT session (`§4.5`, `§5`).
pub const UDP_SESSION_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Valid range for an exposed port registration (`§4.4`).
pub const EXPOSED_PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;
