//! # Relay Application State
//!
//! Holds the shared registries behind the relay's single serialization
//! boundary (`spec §5`): the session registry, the port registry, the
//! running per-port proxy listeners, and the control port's UDP data
//! channel. Cloned and passed into every axum handler, same as the
//! teacher's `AppState`.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::port_registry::PortRegistry;
use crate::proxy::ProxyManager;
use crate::session::SessionRegistry;
use crate::udp_channel::UdpChannelManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub ports: Arc<PortRegistry>,
    pub proxies: Arc<ProxyManager>,
    /// The control port's UDP socket, bound once in `main` before the
    /// HTTP server starts serving requests.
    pub udp_channel: Arc<UdpChannelManager>,
}

impl AppState {
    pub fn new(config: RelayConfig, udp_channel: Arc<UdpChannelManager>) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::new()),
            ports: Arc::new(PortRegistry::new()),
            proxies: Arc::new(ProxyManager::new()),
            udp_channel,
        }
    }
}
