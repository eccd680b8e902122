//! # Agent Controller
//!
//! Drives the full connection lifecycle against a relay (`spec §4.6`):
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Ready -> Disconnected -> BackoffWait -> Connecting -> ...
//! ```
//!
//! `run` never returns except on [`AgentError::MaxReconnectAttemptsReached`]
//! or a config/bind error it cannot recover from; every other failure folds
//! back into the backoff loop.

use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use tunnel_protocol::control::{
    AuthPayload, ControlBody, HeartbeatPayload, RegisterPayload,
};
use tunnel_protocol::{AgentId, ControlMessage, PendingRequests, ProtocolError, RequestId};

use crate::config::AgentConfig;
use crate::connection::ConnectionTable;
use crate::data_channel;
use crate::error::AgentError;
use crate::proxy::{self, BridgeContext, ProxyManager};
use crate::udp_channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Connecting,
    Authenticating,
    Ready,
    Disconnected,
    BackoffWait,
}

/// Runs the agent forever, reconnecting with exponential backoff until
/// `config.max_reconnect_attempts` consecutive failures are reached.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let mut attempt: u32 = 0;

    loop {
        log_state(ControllerState::Connecting);
        match connect_and_run(&config).await {
            Ok(()) => {
                // A clean session (relay closed the socket after some time
                // connected) resets the backoff counter.
                attempt = 0;
                log_state(ControllerState::Disconnected);
            }
            Err(e) => {
                warn!(error = %e, "session ended with an error");
                log_state(ControllerState::Disconnected);
            }
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            warn!(attempt, "giving up after exceeding max reconnect attempts");
            return Err(AgentError::MaxReconnectAttemptsReached);
        }

        let delay = backoff_delay(config.reconnect_base_delay, config.reconnect_max_delay, attempt);
        log_state(ControllerState::BackoffWait);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

/// `min(base * 2^attempt, max) + jitter(0, 1000ms)` (`spec §4.6`, §8).
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = scaled.min(max);
    let jitter_ms = rand::rng().random_range(0..1000);
    capped + Duration::from_millis(jitter_ms)
}

/// One full connect -> authenticate -> serve cycle. Returns once the
/// control socket closes for any reason.
async fn connect_and_run(config: &AgentConfig) -> Result<(), AgentError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(&config.relay_ws_url)
        .await
        .map_err(|e| AgentError::PeerIoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let pending: Arc<PendingRequests<ControlBody>> = Arc::new(PendingRequests::new());

    let mut outbound_task = tokio::spawn(async move {
        while let Some(msg) = control_rx.recv().await {
            if ws_sink.send(WsMessage::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    log_state(ControllerState::Authenticating);
    let auth_id = RequestId::new();
    let _ = control_tx.send(ControlMessage::new(
        auth_id,
        ControlBody::Auth(AuthPayload {
            token: config.auth_token.clone(),
        }),
    ));

    let reader_pending = pending.clone();
    let connections = Arc::new(ConnectionTable::new());
    let reader_connections = connections.clone();
    let proxies = Arc::new(ProxyManager::new(&config.proxies));
    let bridge_ctx_slot: Arc<std::sync::Mutex<Option<Arc<BridgeContext>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let reader_ctx_slot = bridge_ctx_slot.clone();

    let mut reader_task = tokio::spawn(async move {
        while let Some(next) = ws_stream.next().await {
            let Ok(WsMessage::Text(text)) = next else {
                break;
            };
            match ControlMessage::from_json(&text) {
                Ok(msg) => {
                    if reader_pending.complete(&msg.id, msg.body.clone()) {
                        continue;
                    }
                    dispatch_unsolicited(&reader_ctx_slot, &reader_connections, msg.body).await;
                }
                Err(e) => {
                    debug!(error = %e, "malformed control message from relay, ignoring");
                }
            }
        }
    });

    let auth_result = pending.wait(auth_id, config.request_timeout).await;
    let agent_id = match auth_result {
        Ok(ControlBody::AuthResp(resp)) if resp.success => {
            let Some(id_str) = resp.client_id else {
                return finish(outbound_task, reader_task, AgentError::DataChannelAuthFailed);
            };
            match id_str.parse::<AgentId>() {
                Ok(id) => id,
                Err(_) => {
                    return finish(outbound_task, reader_task, AgentError::DataChannelAuthFailed);
                }
            }
        }
        Ok(_) => {
            return finish(outbound_task, reader_task, AgentError::DataChannelAuthFailed);
        }
        Err(ProtocolError::RequestTimeout(_)) => {
            return finish(outbound_task, reader_task, AgentError::HeartbeatTimeout);
        }
        Err(e) => {
            return finish(outbound_task, reader_task, AgentError::Protocol(e));
        }
    };
    info!(%agent_id, "authenticated with relay");

    let tcp_data_channel = match data_channel::connect(&config.relay_data_addr, agent_id, connections.clone()).await
    {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            warn!(error = %e, "mandatory tcp data channel failed to connect");
            return finish(outbound_task, reader_task, e);
        }
    };

    let udp_data_channel = {
        let relay_addr = config
            .relay_data_addr
            .parse::<std::net::SocketAddr>()
            .ok()
            .map(|addr| udp_channel::connect(addr, agent_id, connections.clone()));
        match relay_addr {
            Some(fut) => match fut.await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "best-effort udp data channel failed, continuing without it");
                    None
                }
            },
            None => {
                warn!(addr = %config.relay_data_addr, "relay_data_addr is not a socket address, skipping udp channel");
                None
            }
        }
    };

    let bridge_ctx = Arc::new(BridgeContext {
        control_tx: control_tx.clone(),
        connections: connections.clone(),
        proxies: proxies.clone(),
        tcp_data_channel: tcp_data_channel.clone(),
        udp_data_channel: std::sync::Mutex::new(udp_data_channel),
        udp_idle_timeout: config.udp_idle_timeout,
    });
    *bridge_ctx_slot.lock().unwrap() = Some(bridge_ctx.clone());

    for proxy_cfg in &config.proxies {
        if let Err(e) = register_proxy(&control_tx, &pending, config.request_timeout, proxy_cfg).await {
            warn!(port = proxy_cfg.remote_port, error = %e, "failed to register proxy");
        }
    }

    log_state(ControllerState::Ready);
    let heartbeat_task = spawn_heartbeat(control_tx.clone(), config.heartbeat_interval);

    // Block until either worker task ends the session, then tear down the other.
    tokio::select! {
        _ = &mut outbound_task => { reader_task.abort(); }
        _ = &mut reader_task => { outbound_task.abort(); }
    }

    heartbeat_task.abort();
    connections.clear();
    Ok(())
}

fn finish(
    outbound_task: tokio::task::JoinHandle<()>,
    reader_task: tokio::task::JoinHandle<()>,
    err: AgentError,
) -> Result<(), AgentError> {
    outbound_task.abort();
    reader_task.abort();
    Err(err)
}

async fn register_proxy(
    control_tx: &mpsc::UnboundedSender<ControlMessage>,
    pending: &Arc<PendingRequests<ControlBody>>,
    request_timeout: Duration,
    proxy_cfg: &crate::config::ProxyConfig,
) -> Result<(), AgentError> {
    let id = RequestId::new();
    control_tx
        .send(ControlMessage::new(
            id,
            ControlBody::Register(RegisterPayload {
                remote_port: proxy_cfg.remote_port,
                local_port: proxy_cfg.local_port,
                local_host: Some(proxy_cfg.local_host.clone()),
            }),
        ))
        .map_err(|_| AgentError::DataChannelAuthFailed)?;

    match pending.wait(id, request_timeout).await? {
        ControlBody::RegisterResp(resp) if resp.success => {
            info!(
                remote_port = proxy_cfg.remote_port,
                remote_url = resp.remote_url.as_deref().unwrap_or_default(),
                "proxy registered"
            );
            Ok(())
        }
        ControlBody::RegisterResp(resp) => {
            warn!(
                remote_port = proxy_cfg.remote_port,
                error = resp.error.as_deref().unwrap_or("unknown"),
                "relay rejected proxy registration"
            );
            Ok(())
        }
        _ => Ok(()),
    }
}

fn spawn_heartbeat(
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let sent = control_tx.send(ControlMessage::unsolicited(ControlBody::Heartbeat(
                HeartbeatPayload { timestamp },
            )));
            if sent.is_err() {
                break;
            }
        }
    })
}

async fn dispatch_unsolicited(
    bridge_ctx_slot: &Arc<std::sync::Mutex<Option<Arc<BridgeContext>>>>,
    connections: &Arc<ConnectionTable>,
    body: ControlBody,
) {
    match body {
        ControlBody::NewConnection(payload) => {
            let Some(ctx) = bridge_ctx_slot.lock().unwrap().clone() else {
                return;
            };
            proxy::handle_new_connection(ctx, payload).await;
        }
        ControlBody::ConnectionClose(payload) => {
            if let Ok(conn_id) = payload.connection_id.parse::<tunnel_protocol::ExternalConnId>() {
                connections.remove(&conn_id);
            }
        }
        ControlBody::ConnectionError(payload) => {
            warn!(id = %payload.connection_id, error = %payload.error, "relay reported connection error");
            if let Ok(conn_id) = payload.connection_id.parse::<tunnel_protocol::ExternalConnId>() {
                connections.remove(&conn_id);
            }
        }
        other => {
            debug!(?other, "unsolicited message with no handler, ignoring");
        }
    }
}

fn log_state(state: ControllerState) {
    debug!(?state, "controller state transition");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_plus_jitter() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        for attempt in 0..20 {
            let delay = backoff_delay(base, max, attempt);
            assert!(delay <= max + Duration::from_millis(999));
            assert!(delay >= base.min(max));
        }
    }

    #[test]
    fn backoff_grows_before_capping() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        let early = backoff_delay(base, max, 1);
        let later = backoff_delay(base, max, 5);
        assert!(later >= early);
    }
}
