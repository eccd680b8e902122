//! # Tunnel Relay
//!
//! The externally reachable peer of the tunneling engine. A single
//! advertised port carries three multiplexed transports: the agent
//! control channel (WebSocket), the framed TCP data channel, and the UDP
//! data channel (`spec §1`, §6). Each registered exposed port gets its
//! own TCP and UDP listeners, owned by the per-port proxy.
//!
//! ## Modules
//!
//! - [`config`]       — immutable startup configuration
//! - [`error`]        — relay-side error kinds
//! - [`connection`]   — per-external-connection record
//! - [`session`]      — agent session + session registry
//! - [`port_registry`]— exposed-port ownership registry
//! - [`data_channel`] — TCP data-channel manager
//! - [`udp_channel`]  — UDP data-channel manager
//! - [`proxy`]        — per-port TCP/UDP proxy listeners
//! - [`control`]      — control dispatcher (WebSocket state machine)
//! - [`ingress`]      — control-port classifier (data channel vs HTTP/WS)
//! - [`heartbeat`]    — session-expiry sweeper
//! - [`state`]        — shared application state
//! - [`api`]          — read-only admin endpoints

mod api;
mod config;
mod connection;
mod control;
mod data_channel;
mod error;
mod heartbeat;
mod ingress;
mod port_registry;
mod proxy;
mod session;
mod state;
mod udp_channel;

use axum::{routing::get, Router};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::state::AppState;
use crate::udp_channel::UdpChannelManager;

fn config_from_env() -> RelayConfig {
    let mut config = RelayConfig::default();

    if let Ok(addr) = std::env::var("TUNNEL_BIND_ADDR") {
        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            config.bind_addr = parsed;
        }
    }

    if let Ok(tokens) = std::env::var("TUNNEL_TOKENS") {
        config.tokens = tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<HashSet<_>>();
    }

    if let Ok(host) = std::env::var("TUNNEL_ADVERTISED_HOST") {
        config.advertised_host = host;
    }

    if let Ok(secs) = std::env::var("TUNNEL_HEARTBEAT_SECS") {
        if let Ok(parsed) = secs.parse() {
            config.heartbeat_interval = std::time::Duration::from_secs(parsed);
        }
    }

    if let Ok(secs) = std::env::var("TUNNEL_SESSION_TIMEOUT_SECS") {
        if let Ok(parsed) = secs.parse() {
            config.session_timeout = std::time::Duration::from_secs(parsed);
        }
    }

    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_relay=info".into()),
        )
        .init();

    let config = config_from_env();
    let bind_addr = config.bind_addr;
    let sweep_interval = config.sweep_interval;
    let session_timeout = config.session_timeout;

    let udp_socket = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .expect("failed to bind control-port UDP socket"),
    );
    let udp_channel = UdpChannelManager::new(udp_socket);

    let state = AppState::new(config, udp_channel.clone());

    tokio::spawn(udp_channel.run(state.sessions.clone()));
    tokio::spawn(heartbeat::run(state.clone(), sweep_interval, session_timeout));

    let app = Router::new()
        .route("/ws", get(control::ws_handler))
        .route("/api/agents", get(api::list_agents))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind control-port TCP listener");

    let (http_tx, http_rx) = mpsc::channel(256);
    tokio::spawn(ingress::run_tcp(tcp_listener, state.sessions.clone(), http_tx));

    info!(%bind_addr, "tunnel relay listening");
    let channel_listener = ingress::ChannelListener::new(http_rx, bind_addr);
    axum::serve(channel_listener, app)
        .await
        .expect("control port server exited");
}
