//! # Agent Configuration
//!
//! `AgentConfig` is a plain immutable record passed into [`crate::controller::run`]
//! by the caller. Loading it from a file or environment is a boundary concern
//! (`spec §1`, §6) — `main.rs` does the minimal env-var reading needed to
//! exercise the engine; it is not a config-file layer.

use std::time::Duration;

/// One configured exposed port: register `remote_port` on the relay and
/// bridge its traffic to `local_host:local_port`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub remote_port: u16,
    pub local_port: u16,
    pub local_host: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the relay's control channel, e.g. `ws://host:7070/ws`.
    pub relay_ws_url: String,

    /// Host/port of the relay's single control port, used for the raw TCP
    /// data channel and the UDP data channel (`spec §1`, §6).
    pub relay_data_addr: String,

    /// Bearer token presented in `AUTH`.
    pub auth_token: String,

    /// Exposed ports to register once authenticated.
    pub proxies: Vec<ProxyConfig>,

    /// Interval between `HEARTBEAT` messages while `Ready` (`spec §4.6`).
    pub heartbeat_interval: Duration,

    /// Deadline for a pending control request (`spec §4.2`).
    pub request_timeout: Duration,

    /// Inactivity timeout for a local-side UDP session.
    pub udp_idle_timeout: Duration,

    /// Base delay for the reconnect backoff sequence (`spec §4.6`).
    pub reconnect_base_delay: Duration,

    /// Upper bound the backoff delay is capped at before jitter.
    pub reconnect_max_delay: Duration,

    /// Consecutive reconnect failures before giving up (`spec §7`,
    /// `MaxReconnectAttemptsReached`).
    pub max_reconnect_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_ws_url: "ws://127.0.0.1:7070/ws".to_string(),
            relay_data_addr: "127.0.0.1:7070".to_string(),
            auth_token: String::new(),
            proxies: Vec::new(),
            heartbeat_interval: tunnel_protocol::HEARTBEAT_INTERVAL,
            request_timeout: tunnel_protocol::DEFAULT_REQUEST_TIMEOUT,
            udp_idle_timeout: tunnel_protocol::UDP_SESSION_IDLE_TIMEOUT,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}
