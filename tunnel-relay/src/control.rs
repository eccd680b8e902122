//! # Control Dispatcher
//!
//! One instance of the `UNAUTH → AUTHENTICATED → CLOSED` state machine
//! (`spec §4.4`) per accepted control WebSocket. Mirrors the teacher's
//! `handlers.rs` connection lifecycle: split the socket, drain an
//! outbound queue from a spawned task, dispatch inbound frames on the
//! current task, clean up on disconnect.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::control::{
    AuthRespPayload, ConnectionClosePayload, ConnectionErrorPayload, ControlBody,
    HeartbeatRespPayload, RegisterRespPayload,
};
use tunnel_protocol::{AgentId, ControlMessage, ExternalConnId, ProtocolError, RequestId};

use crate::error::RelayError;
use crate::session::AgentSession;
use crate::state::AppState;

/// Authentication must complete within this long of socket open
/// (`spec §4.4`, §5). Fixed by the state diagram, not configurable.
const AUTH_DEADLINE: Duration = Duration::from_secs(30);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut shutdown_tx = Some(shutdown_tx);

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = control_rx.recv().await {
            if ws_sink.send(Message::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let mut agent_id: Option<AgentId> = None;
    let auth_timeout = tokio::time::sleep(AUTH_DEADLINE);
    tokio::pin!(auth_timeout);

    loop {
        tokio::select! {
            next = ws_stream.next() => {
                let Some(Ok(msg)) = next else { break; };
                match msg {
                    Message::Text(text) => {
                        let should_close = handle_text(&state, &control_tx, &mut agent_id, &mut shutdown_tx, &text).await;
                        if should_close {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = &mut auth_timeout, if agent_id.is_none() => {
                info!("control socket auth deadline expired");
                break;
            }
            // Fired by `teardown_session` when an external actor (the
            // heartbeat sweeper) evicts this session: the socket must close
            // too, not just the session bookkeeping.
            _ = &mut shutdown_rx => {
                info!(?agent_id, "control socket shut down by session teardown");
                break;
            }
        }
    }

    outbound_task.abort();

    let Some(agent_id) = agent_id else {
        return;
    };
    info!(%agent_id, "control socket closed, tearing down session");
    teardown_session(&state, agent_id).await;
}

/// Returns `true` if the caller's read loop must close the socket now.
async fn handle_text(
    state: &AppState,
    control_tx: &mpsc::UnboundedSender<ControlMessage>,
    agent_id: &mut Option<AgentId>,
    shutdown_tx: &mut Option<tokio::sync::oneshot::Sender<()>>,
    text: &str,
) -> bool {
    let parsed = ControlMessage::from_json(text);

    let Some(current) = *agent_id else {
        return match parsed {
            Ok(ControlMessage {
                id,
                body: ControlBody::Auth(payload),
            }) => handle_auth(state, control_tx, agent_id, shutdown_tx, id, payload.token).await,
            Ok(msg) => {
                reply_not_authenticated(control_tx, msg.id);
                false
            }
            Err(e) => {
                reply_protocol_error(control_tx, e);
                false
            }
        };
    };

    let Some(session) = state.sessions.get(&current) else {
        return false;
    };

    match parsed {
        Ok(msg) => dispatch_authenticated(state, &session, msg).await,
        Err(e) => reply_protocol_error(control_tx, e),
    }
    false
}

/// Returns `true` if authentication failed and the socket must be closed
/// (`spec §4.4`: an invalid or empty `AUTH` token ends the connection
/// rather than leaving it open for further attempts).
async fn handle_auth(
    state: &AppState,
    control_tx: &mpsc::UnboundedSender<ControlMessage>,
    agent_id: &mut Option<AgentId>,
    shutdown_tx: &mut Option<tokio::sync::oneshot::Sender<()>>,
    request_id: RequestId,
    token: String,
) -> bool {
    if token.is_empty() {
        let _ = control_tx.send(ControlMessage::new(
            request_id,
            ControlBody::AuthResp(AuthRespPayload {
                success: false,
                client_id: None,
                error: Some(RelayError::EmptyToken.to_string()),
            }),
        ));
        return true;
    }

    if !state.config.tokens.contains(&token) {
        let _ = control_tx.send(ControlMessage::new(
            request_id,
            ControlBody::AuthResp(AuthRespPayload {
                success: false,
                client_id: None,
                error: Some(RelayError::InvalidToken.to_string()),
            }),
        ));
        return true;
    }

    let new_id = AgentId::new();
    let session = std::sync::Arc::new(AgentSession::new(new_id, control_tx.clone()));
    session.touch_heartbeat();
    if let Some(tx) = shutdown_tx.take() {
        session.set_shutdown_signal(tx);
    }
    state.sessions.insert(session);
    *agent_id = Some(new_id);

    info!(agent_id = %new_id, "agent authenticated");
    let _ = control_tx.send(ControlMessage::new(
        request_id,
        ControlBody::AuthResp(AuthRespPayload {
            success: true,
            client_id: Some(new_id.to_string()),
            error: None,
        }),
    ));
    false
}

async fn dispatch_authenticated(state: &AppState, session: &AgentSession, msg: ControlMessage) {
    match msg.body {
        ControlBody::Auth(_) => {
            // Already authenticated: idempotent success, same agent id.
            let _ = session.control_tx.send(ControlMessage::new(
                msg.id,
                ControlBody::AuthResp(AuthRespPayload {
                    success: true,
                    client_id: Some(session.agent_id.to_string()),
                    error: None,
                }),
            ));
        }
        ControlBody::Register(p) => {
            handle_register(state, session, msg.id, p.remote_port).await;
        }
        ControlBody::Unregister(p) => {
            handle_unregister(state, session, p.remote_port).await;
        }
        ControlBody::Heartbeat(p) => {
            session.touch_heartbeat();
            let _ = session.control_tx.send(ControlMessage::new(
                msg.id,
                ControlBody::HeartbeatResp(HeartbeatRespPayload {
                    timestamp: p.timestamp,
                }),
            ));
        }
        ControlBody::ConnectionClose(p) => {
            handle_connection_close(session, &p.connection_id);
        }
        ControlBody::ConnectionError(p) => {
            warn!(agent_id = %session.agent_id, error = %p.error, "agent reported connection error");
            handle_connection_close(session, &p.connection_id);
        }
        ControlBody::NewConnection(_) => {
            // Relay-originated message; an agent sending one is a protocol
            // misuse, not a fatal error for the session.
            warn!(agent_id = %session.agent_id, "agent sent NEW_CONNECTION, ignoring");
        }
        ControlBody::AuthResp(_) | ControlBody::RegisterResp(_) | ControlBody::HeartbeatResp(_) => {
            warn!(agent_id = %session.agent_id, "agent sent a relay-to-agent response type, ignoring");
        }
    }
}

async fn handle_register(state: &AppState, session: &AgentSession, id: RequestId, port: u16) {
    if !tunnel_protocol::EXPOSED_PORT_RANGE.contains(&port) {
        let _ = session.control_tx.send(ControlMessage::new(
            id,
            ControlBody::RegisterResp(RegisterRespPayload {
                success: false,
                remote_port: None,
                remote_url: None,
                error: Some(RelayError::PortOutOfRange(port).to_string()),
            }),
        ));
        return;
    }

    if let Err(e) = state.ports.register(port, session.agent_id) {
        let _ = session.control_tx.send(ControlMessage::new(
            id,
            ControlBody::RegisterResp(RegisterRespPayload {
                success: false,
                remote_port: None,
                remote_url: None,
                error: Some(e.to_string()),
            }),
        ));
        return;
    }

    let started = state
        .proxies
        .start(
            port,
            "0.0.0.0",
            session.agent_id,
            state.sessions.clone(),
            state.udp_channel.clone(),
            state.config.udp_idle_timeout,
        )
        .await;

    if let Err(e) = started {
        state.ports.unregister(port, session.agent_id).ok();
        let _ = session.control_tx.send(ControlMessage::new(
            id,
            ControlBody::RegisterResp(RegisterRespPayload {
                success: false,
                remote_port: None,
                remote_url: None,
                error: Some(e.to_string()),
            }),
        ));
        return;
    }

    info!(agent_id = %session.agent_id, port, "exposed port registered");
    let remote_url = format!("{}:{}", state.config.advertised_host, port);
    let _ = session.control_tx.send(ControlMessage::new(
        id,
        ControlBody::RegisterResp(RegisterRespPayload {
            success: true,
            remote_port: Some(port),
            remote_url: Some(remote_url),
            error: None,
        }),
    ));
}

async fn handle_unregister(state: &AppState, session: &AgentSession, port: u16) {
    match state.ports.unregister(port, session.agent_id) {
        Ok(()) => {
            state.proxies.stop(port);
            let closed: Vec<ExternalConnId> = session
                .connections
                .iter()
                .filter(|e| e.value().port == port)
                .map(|e| *e.key())
                .collect();
            for conn_id in closed {
                let _ = session.control_tx.send(ControlMessage::unsolicited(
                    ControlBody::ConnectionClose(ConnectionClosePayload {
                        connection_id: conn_id.to_string(),
                    }),
                ));
                if let Some((_, record)) = session.connections.remove(&conn_id) {
                    record.abort_tasks();
                }
            }
            info!(agent_id = %session.agent_id, port, "exposed port unregistered");
        }
        Err(e) => {
            warn!(agent_id = %session.agent_id, port, error = %e, "unregister of unowned port");
            let _ = session.control_tx.send(ControlMessage::unsolicited(
                ControlBody::ConnectionError(ConnectionErrorPayload {
                    connection_id: port.to_string(),
                    error: e.to_string(),
                }),
            ));
        }
    }
}

fn handle_connection_close(session: &AgentSession, connection_id: &str) {
    let Ok(conn_id) = connection_id.parse::<ExternalConnId>() else {
        return;
    };
    if let Some((_, record)) = session.connections.remove(&conn_id) {
        record.abort_tasks();
    }
}

fn reply_not_authenticated(control_tx: &mpsc::UnboundedSender<ControlMessage>, id: RequestId) {
    let _ = control_tx.send(ControlMessage::new(
        id,
        ControlBody::ConnectionError(ConnectionErrorPayload {
            connection_id: String::new(),
            error: RelayError::NotAuthenticated.to_string(),
        }),
    ));
}

fn reply_protocol_error(control_tx: &mpsc::UnboundedSender<ControlMessage>, e: ProtocolError) {
    let _ = control_tx.send(ControlMessage::unsolicited(ControlBody::ConnectionError(
        ConnectionErrorPayload {
            connection_id: String::new(),
            error: e.to_string(),
        },
    )));
}

/// Session-removal cascade (`spec §3`): release owned ports, stop their
/// proxy listeners, close every external connection, drop the data
/// channel, then remove the session itself.
pub async fn teardown_session(state: &AppState, agent_id: AgentId) {
    let Some(session) = state.sessions.remove(&agent_id) else {
        return;
    };

    for conn_id in session
        .connections
        .iter()
        .map(|e| *e.key())
        .collect::<Vec<_>>()
    {
        if let Some((_, record)) = session.connections.remove(&conn_id) {
            record.abort_tasks();
        }
    }

    for port in state.ports.release_all_for(agent_id) {
        state.proxies.stop(port);
    }

    session.replace_data_channel(None);
    // Wakes `handle_connection`'s select loop so the real socket closes too;
    // a no-op if that task already exited and dropped its receiver.
    session.fire_shutdown_signal();
}
