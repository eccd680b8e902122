//! # Tunnel Agent
//!
//! The private-network peer of the tunneling engine: dials out to a relay,
//! authenticates, registers the locally configured proxies, and bridges
//! every `NEW_CONNECTION` it is pushed to a local TCP/UDP service
//! (`spec §1`, §6).
//!
//! ## Modules
//!
//! - [`config`]     — immutable startup configuration
//! - [`error`]      — agent-side error kinds
//! - [`connection`] — per-external-connection record
//! - [`data_channel`] — TCP data-channel client
//! - [`udp_channel`] — UDP data-channel client
//! - [`proxy`]      — local-service bridging
//! - [`controller`] — connection lifecycle state machine

mod config;
mod connection;
mod controller;
mod data_channel;
mod error;
mod proxy;
mod udp_channel;

use config::{AgentConfig, ProxyConfig};

/// Parses `TUNNEL_PROXIES` entries of the form `local_host:remote_port:local_port`,
/// comma-separated, e.g. `127.0.0.1:8080:3000,127.0.0.1:2222:22`.
fn parse_proxies(raw: &str) -> Vec<ProxyConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let local_host = parts.next()?.to_string();
            let remote_port = parts.next()?.parse().ok()?;
            let local_port = parts.next()?.parse().ok()?;
            Some(ProxyConfig {
                remote_port,
                local_host,
                local_port,
            })
        })
        .collect()
}

fn config_from_env() -> AgentConfig {
    let mut config = AgentConfig::default();

    if let Ok(url) = std::env::var("TUNNEL_RELAY_URL") {
        config.relay_ws_url = url;
    }
    if let Ok(addr) = std::env::var("TUNNEL_RELAY_DATA_ADDR") {
        config.relay_data_addr = addr;
    }
    if let Ok(token) = std::env::var("TUNNEL_AUTH_TOKEN") {
        config.auth_token = token;
    }
    if let Ok(raw) = std::env::var("TUNNEL_PROXIES") {
        config.proxies = parse_proxies(&raw);
    }
    if let Ok(attempts) = std::env::var("TUNNEL_MAX_RECONNECT_ATTEMPTS") {
        if let Ok(parsed) = attempts.parse() {
            config.max_reconnect_attempts = parsed;
        }
    }

    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let config = config_from_env();
    if config.proxies.is_empty() {
        tracing::warn!("no proxies configured via TUNNEL_PROXIES; agent will connect but expose nothing");
    }

    if let Err(e) = controller::run(config).await {
        tracing::error!(error = %e, "agent exited");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_proxy_list() {
        let proxies = parse_proxies("127.0.0.1:8080:3000,127.0.0.1:2222:22");
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].remote_port, 8080);
        assert_eq!(proxies[0].local_host, "127.0.0.1");
        assert_eq!(proxies[0].local_port, 3000);
        assert_eq!(proxies[1].remote_port, 2222);
        assert_eq!(proxies[1].local_port, 22);
    }

    #[test]
    fn skips_malformed_entries() {
        let proxies = parse_proxies("not-a-valid-entry,127.0.0.1:8080:3000,,");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].remote_port, 8080);
    }

    #[test]
    fn empty_input_yields_no_proxies() {
        assert!(parse_proxies("").is_empty());
    }
}
