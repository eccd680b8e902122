//! # Relay Configuration
//!
//! `RelayConfig` is a plain immutable record passed into [`crate::run`] by
//! the caller. Loading it from a file or environment is a boundary concern
//! (`spec §1`, §6) — `main.rs` does the minimal env-var reading needed to
//! exercise the engine; it is not a config-file layer.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the single control port (TCP + UDP) binds to.
    pub bind_addr: SocketAddr,

    /// Allow-listed bearer tokens accepted by `AUTH`.
    pub tokens: HashSet<String>,

    /// How often the agent is expected to send `HEARTBEAT`.
    pub heartbeat_interval: Duration,

    /// How long a session may go without a heartbeat before the sweeper
    /// removes it.
    pub session_timeout: Duration,

    /// How often the heartbeat sweeper runs.
    pub sweep_interval: Duration,

    /// Inactivity timeout for a UDP NAT session.
    pub udp_idle_timeout: Duration,

    /// Deadline for a pending control request.
    pub request_timeout: Duration,

    /// Host advertised in `REGISTER_RESP.remoteUrl`.
    pub advertised_host: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            tokens: HashSet::new(),
            heartbeat_interval: tunnel_protocol::HEARTBEAT_INTERVAL,
            session_timeout: tunnel_protocol::SESSION_HEARTBEAT_TIMEOUT,
            sweep_interval: tunnel_protocol::HEARTBEAT_SWEEP_INTERVAL,
            udp_idle_timeout: tunnel_protocol::UDP_SESSION_IDLE_TIMEOUT,
            request_timeout: tunnel_protocol::DEFAULT_REQUEST_TIMEOUT,
            advertised_host: "127.0.0.1".to_string(),
        }
    }
}
