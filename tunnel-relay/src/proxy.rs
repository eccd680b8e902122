//! # Per-Port Proxy (relay side)
//!
//! One `ProxyManager` entry per registered exposed port: a TCP listener
//! and a UDP socket, both bound to that port, owned for as long as the
//! port stays registered (`spec §4.4`, §4.5). `REGISTER`/`UNREGISTER`
//! start and stop these through [`ProxyManager`]; the session-removal
//! cascade stops every port a departing agent owned.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_protocol::control::{
    ConnProtocol, ConnectionClosePayload, ControlBody, NewConnectionPayload,
};
use tunnel_protocol::{frame, AgentId, ControlMessage, ExternalConnId};

use crate::connection::ConnectionRecord;
use crate::error::RelayError;
use crate::session::{AgentSession, SessionRegistry};
use crate::udp_channel::UdpChannelManager;

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Classifies a freshly accepted external TCP connection from its first
/// bytes without consuming them (`spec §4.3`).
fn classify_tcp(peek: &[u8]) -> ConnProtocol {
    let text = String::from_utf8_lossy(peek);
    if !HTTP_METHODS.iter().any(|m| text.starts_with(m)) {
        return ConnProtocol::Tcp;
    }
    if text.to_ascii_lowercase().contains("upgrade: websocket") {
        ConnProtocol::Websocket
    } else {
        ConnProtocol::Http
    }
}

struct ProxyHandle {
    tcp_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.tcp_task.abort();
        self.udp_task.abort();
    }
}

/// Owns the running per-port listeners. One TCP + one UDP task per
/// registered exposed port.
#[derive(Default)]
pub struct ProxyManager {
    handles: DashMap<u16, ProxyHandle>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.handles.contains_key(&port)
    }

    /// Starts listeners for `port`, bound to `bind_host`. A no-op if the
    /// port is already running (re-REGISTER by the owning agent).
    pub async fn start(
        &self,
        port: u16,
        bind_host: &str,
        agent_id: AgentId,
        sessions: Arc<SessionRegistry>,
        udp_channel: Arc<UdpChannelManager>,
        udp_idle_timeout: Duration,
    ) -> std::io::Result<()> {
        if self.handles.contains_key(&port) {
            return Ok(());
        }

        let tcp_listener = TcpListener::bind((bind_host, port)).await?;
        let udp_socket = Arc::new(UdpSocket::bind((bind_host, port)).await?);

        let tcp_task = tokio::spawn(run_tcp_proxy(tcp_listener, port, agent_id, sessions.clone()));
        let udp_task = tokio::spawn(run_udp_proxy(
            udp_socket,
            port,
            agent_id,
            sessions,
            udp_channel,
            udp_idle_timeout,
        ));

        self.handles.insert(
            port,
            ProxyHandle {
                tcp_task,
                udp_task,
            },
        );
        Ok(())
    }

    /// Stops the listeners for `port`, if any.
    pub fn stop(&self, port: u16) {
        self.handles.remove(&port);
    }
}

async fn run_tcp_proxy(
    listener: TcpListener,
    port: u16,
    agent_id: AgentId,
    sessions: Arc<SessionRegistry>,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, port, "tcp proxy accept error");
                continue;
            }
        };
        let Some(session) = sessions.get(&agent_id) else {
            debug!(%agent_id, port, "owning session gone, stopping tcp proxy");
            return;
        };
        tokio::spawn(handle_external_tcp(socket, peer_addr, port, session));
    }
}

async fn handle_external_tcp(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
    session: Arc<AgentSession>,
) {
    let mut peek_buf = [0u8; 1024];
    let n = socket.peek(&mut peek_buf).await.unwrap_or(0);
    let protocol = classify_tcp(&peek_buf[..n]);

    let conn_id = ExternalConnId::new();
    let (to_external_tx, mut to_external_rx) = mpsc::channel::<Bytes>(256);
    let record = ConnectionRecord::new_tcp(conn_id, peer_addr, protocol, port, to_external_tx);
    session.connections.insert(conn_id, record);

    session.send(ControlMessage::unsolicited(ControlBody::NewConnection(
        NewConnectionPayload {
            connection_id: conn_id.to_string(),
            protocol,
            remote_port: port,
            remote_address: Some(peer_addr.to_string()),
        },
    )));

    let (mut read_half, mut write_half) = socket.into_split();

    let reader_session = session.clone();
    let reader_task = tokio::spawn(async move {
        let wire_id = conn_id.to_wire_bytes();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let frame = frame::encode_data_frame(&wire_id, &buf[..n]);
            // Extract the handle (a cheap Arc clone) before awaiting so the
            // session's std Mutex guard never crosses an `.await` point.
            let dc = reader_session.data_channel();
            let sent = match dc {
                Some(dc) => dc.send_frame(frame).await,
                None => false,
            };
            if !sent {
                debug!(%conn_id, error = %RelayError::NoDataChannel, "closing external connection");
                break;
            }
            if let Some(record) = reader_session.connections.get(&conn_id) {
                record.touch();
            }
        }
        // Dropping the record drops `to_external_tx`, which ends the writer
        // task's receive loop below.
        reader_session.connections.remove(&conn_id);
        reader_session.send(ControlMessage::unsolicited(ControlBody::ConnectionClose(
            ConnectionClosePayload {
                connection_id: conn_id.to_string(),
            },
        )));
    });

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = to_external_rx.recv().await {
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
        }
    });

    if let Some(record) = session.connections.get(&conn_id) {
        record.track_task(reader_task);
        record.track_task(writer_task);
    }
}

async fn run_udp_proxy(
    socket: Arc<UdpSocket>,
    port: u16,
    agent_id: AgentId,
    sessions: Arc<SessionRegistry>,
    udp_channel: Arc<UdpChannelManager>,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut peer_map: HashMap<SocketAddr, ExternalConnId> = HashMap::new();
    let sweep_period = idle_timeout.clamp(Duration::from_secs(1), Duration::from_secs(5));
    let mut sweep = tokio::time::interval(sweep_period);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, port, "udp proxy recv error");
                        continue;
                    }
                };
                let Some(session) = sessions.get(&agent_id) else {
                    debug!(%agent_id, port, "owning session gone, stopping udp proxy");
                    return;
                };

                let conn_id = match peer_map.get(&peer_addr) {
                    Some(id) => *id,
                    None => {
                        let conn_id = ExternalConnId::new();
                        let record =
                            ConnectionRecord::new_udp(conn_id, peer_addr, port, socket.clone());
                        session.connections.insert(conn_id, record);
                        peer_map.insert(peer_addr, conn_id);
                        session.send(ControlMessage::unsolicited(ControlBody::NewConnection(
                            NewConnectionPayload {
                                connection_id: conn_id.to_string(),
                                protocol: ConnProtocol::Udp,
                                remote_port: port,
                                remote_address: Some(peer_addr.to_string()),
                            },
                        )));
                        conn_id
                    }
                };

                if let Some(record) = session.connections.get(&conn_id) {
                    record.touch();
                }
                udp_channel
                    .send_to_agent(&agent_id, &conn_id.to_wire_bytes(), &buf[..n])
                    .await;
            }
            _ = sweep.tick() => {
                let Some(session) = sessions.get(&agent_id) else {
                    debug!(%agent_id, port, "owning session gone, stopping udp proxy");
                    return;
                };
                let mut expired = Vec::new();
                for (peer_addr, conn_id) in peer_map.iter() {
                    if let Some(record) = session.connections.get(conn_id) {
                        if record.idle_for() > idle_timeout {
                            expired.push((*peer_addr, *conn_id));
                        }
                    }
                }
                for (peer_addr, conn_id) in expired {
                    peer_map.remove(&peer_addr);
                    session.connections.remove(&conn_id);
                    session.send(ControlMessage::unsolicited(ControlBody::ConnectionClose(
                        ConnectionClosePayload {
                            connection_id: conn_id.to_string(),
                        },
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_method_tokens() {
        assert_eq!(
            classify_tcp(b"GET /ping HTTP/1.1\r\n"),
            ConnProtocol::Http
        );
        assert_eq!(
            classify_tcp(b"POST /submit HTTP/1.1\r\n"),
            ConnProtocol::Http
        );
    }

    #[test]
    fn classifies_upgrade_header_as_websocket() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(classify_tcp(req), ConnProtocol::Websocket);
    }

    #[test]
    fn classifies_non_http_as_raw_tcp() {
        assert_eq!(classify_tcp(&[0x00, 0x01, 0x02, 0xFF]), ConnProtocol::Tcp);
    }
}
