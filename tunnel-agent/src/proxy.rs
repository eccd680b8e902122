//! # Proxy Manager and Per-Connection Bridging (agent side)
//!
//! Mirrors the relay's `proxy` module from the other direction: instead
//! of accepting external traffic, the agent reacts to `NEW_CONNECTION`
//! by opening a local socket and bridging bytes to/from the matching
//! data channel (`spec §4.5`).

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_protocol::control::{
    ConnProtocol, ConnectionClosePayload, ControlBody, NewConnectionPayload,
};
use tunnel_protocol::{frame, ControlMessage, ExternalConnId};

use crate::config::ProxyConfig;
use crate::connection::{AgentConnection, ConnectionTable};
use crate::data_channel::TcpDataChannelHandle;
use crate::error::AgentError;
use crate::udp_channel::UdpChannelHandle;

/// Bound on the relay→local delivery queue, matching
/// `tunnel-agent::data_channel`'s outbound bound (`spec §4.5`/§9).
const TO_LOCAL_QUEUE_CAPACITY: usize = 256;

/// Maps each registered `remote_port` to the local address it bridges to.
#[derive(Default)]
pub struct ProxyManager {
    targets: DashMap<u16, ProxyConfig>,
}

impl ProxyManager {
    pub fn new(proxies: &[ProxyConfig]) -> Self {
        let targets = DashMap::new();
        for p in proxies {
            targets.insert(p.remote_port, p.clone());
        }
        Self { targets }
    }

    pub fn target_for(&self, remote_port: u16) -> Option<ProxyConfig> {
        self.targets.get(&remote_port).map(|e| e.clone())
    }
}

/// Everything a freshly spawned bridging task needs to talk back to the
/// relay. One instance per connection attempt; rebuilt on every reconnect.
pub struct BridgeContext {
    pub control_tx: mpsc::UnboundedSender<ControlMessage>,
    pub connections: Arc<ConnectionTable>,
    pub proxies: Arc<ProxyManager>,
    pub tcp_data_channel: Arc<TcpDataChannelHandle>,
    pub udp_data_channel: std::sync::Mutex<Option<Arc<UdpChannelHandle>>>,
    pub udp_idle_timeout: Duration,
}

impl BridgeContext {
    fn send_close(&self, conn_id: ExternalConnId) {
        let _ = self.control_tx.send(ControlMessage::unsolicited(
            ControlBody::ConnectionClose(ConnectionClosePayload {
                connection_id: conn_id.to_string(),
            }),
        ));
    }

    fn udp_channel(&self) -> Option<Arc<UdpChannelHandle>> {
        self.udp_data_channel.lock().unwrap().clone()
    }
}

/// Handles a `NEW_CONNECTION` pushed by the relay: looks up the local
/// target for `payload.remote_port` and spawns the matching bridge.
pub async fn handle_new_connection(ctx: Arc<BridgeContext>, payload: NewConnectionPayload) {
    let Ok(conn_id) = payload.connection_id.parse::<ExternalConnId>() else {
        warn!(id = %payload.connection_id, "NEW_CONNECTION carried an invalid connection id");
        return;
    };

    let Some(target) = ctx.proxies.target_for(payload.remote_port) else {
        warn!(port = payload.remote_port, "NEW_CONNECTION for an unregistered port, closing");
        ctx.send_close(conn_id);
        return;
    };

    let (to_local_tx, to_local_rx) = mpsc::channel::<Bytes>(TO_LOCAL_QUEUE_CAPACITY);
    let record = Arc::new(AgentConnection::new(
        conn_id,
        payload.protocol,
        payload.remote_port,
        to_local_tx,
    ));
    ctx.connections.insert(record.clone());

    info!(%conn_id, port = payload.remote_port, protocol = ?payload.protocol, "bridging new connection to local service");

    match payload.protocol {
        ConnProtocol::Udp => {
            let handle = tokio::spawn(bridge_udp(ctx.clone(), conn_id, target, to_local_rx));
            record.track_task(handle);
        }
        ConnProtocol::Http | ConnProtocol::Websocket | ConnProtocol::Tcp => {
            let handle = tokio::spawn(bridge_tcp(ctx.clone(), conn_id, target, to_local_rx));
            record.track_task(handle);
        }
    }
}

async fn bridge_tcp(
    ctx: Arc<BridgeContext>,
    conn_id: ExternalConnId,
    target: ProxyConfig,
    mut to_local_rx: mpsc::Receiver<Bytes>,
) {
    let local_addr = (target.local_host.as_str(), target.local_port);
    let stream = match TcpStream::connect(local_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%conn_id, error = %AgentError::LocalConnectRefused, source = %e, "closing local bridge");
            ctx.connections.remove(&conn_id);
            ctx.send_close(conn_id);
            return;
        }
    };

    let wire_id = conn_id.to_wire_bytes();
    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(payload) = to_local_rx.recv().await {
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
        }
    });

    let reader_ctx = ctx.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let frame = frame::encode_data_frame(&wire_id, &buf[..n]);
            if !reader_ctx.tcp_data_channel.send_frame(frame).await {
                debug!(%conn_id, "tcp data channel gone, closing local bridge");
                break;
            }
            if let Some(conn) = reader_ctx.connections.get(&conn_id) {
                conn.touch();
            }
        }
        if reader_ctx.connections.remove(&conn_id) {
            reader_ctx.send_close(conn_id);
        }
    });

    if let Some(record) = ctx.connections.get(&conn_id) {
        record.track_task(writer);
        record.track_task(reader);
    }
}

async fn bridge_udp(
    ctx: Arc<BridgeContext>,
    conn_id: ExternalConnId,
    target: ProxyConfig,
    mut to_local_rx: mpsc::Receiver<Bytes>,
) {
    let local_addr: SocketAddr = match format!("{}:{}", target.local_host, target.local_port).parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(%conn_id, error = %e, "invalid local udp target, closing");
            ctx.connections.remove(&conn_id);
            ctx.send_close(conn_id);
            return;
        }
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!(%conn_id, error = %e, "failed to bind local udp socket, closing");
            ctx.connections.remove(&conn_id);
            ctx.send_close(conn_id);
            return;
        }
    };
    if let Err(e) = socket.connect(local_addr).await {
        warn!(%conn_id, error = %e, "local udp connect refused, closing");
        ctx.connections.remove(&conn_id);
        ctx.send_close(conn_id);
        return;
    }

    let wire_id = conn_id.to_wire_bytes();
    let mut recv_buf = vec![0u8; 64 * 1024];
    let mut idle_check = tokio::time::interval(ctx.udp_idle_timeout.clamp(
        Duration::from_secs(1),
        Duration::from_secs(5),
    ));

    loop {
        tokio::select! {
            incoming = to_local_rx.recv() => {
                match incoming {
                    Some(payload) => {
                        if socket.send(&payload).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            result = socket.recv(&mut recv_buf) => {
                let n = match result {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if let Some(conn) = ctx.connections.get(&conn_id) {
                    conn.touch();
                }
                if let Some(udp) = ctx.udp_channel() {
                    udp.send_data(&wire_id, &recv_buf[..n]).await;
                }
            }
            _ = idle_check.tick() => {
                let idle = ctx.connections.get(&conn_id).map(|c| c.idle_for());
                if idle.map(|d| d > ctx.udp_idle_timeout).unwrap_or(true) {
                    debug!(%conn_id, "udp local bridge idle timeout");
                    break;
                }
            }
        }
    }

    if ctx.connections.remove(&conn_id) {
        ctx.send_close(conn_id);
    }
}
