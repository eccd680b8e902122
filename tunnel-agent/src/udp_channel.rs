//! # UDP Data-Channel Client (agent side)
//!
//! Best-effort channel (`spec §4.6`): brought up after the TCP data
//! channel, but its failure does not prevent reaching `Ready`. Sends a
//! `register` frame on connect, a `keep-alive` frame on a fixed interval
//! to survive NAT rebinding, and dispatches inbound data frames to the
//! matching connection's local UDP bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_protocol::udp::{self, UdpFrame};
use tunnel_protocol::AgentId;

use crate::connection::ConnectionTable;
use crate::error::AgentError;

/// How often the agent refreshes its UDP NAT mapping at the relay. Well
/// under the relay's 30s `UDP_SESSION_IDLE_TIMEOUT`, so a connection never
/// lapses as long as this task is alive.
pub const UDP_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct UdpChannelHandle {
    socket: Arc<UdpSocket>,
    keep_alive_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl UdpChannelHandle {
    /// Sends a data frame for `conn_id` to the relay.
    pub async fn send_data(&self, conn_id_wire: &[u8; tunnel_protocol::ID_WIRE_LEN], payload: &[u8]) -> bool {
        let frame = udp::encode_data_frame(conn_id_wire, payload);
        self.socket.send(&frame).await.is_ok()
    }
}

impl Drop for UdpChannelHandle {
    fn drop(&mut self) {
        self.keep_alive_task.abort();
        self.reader_task.abort();
    }
}

pub async fn connect(
    relay_addr: SocketAddr,
    agent_id: AgentId,
    connections: Arc<ConnectionTable>,
) -> Result<Arc<UdpChannelHandle>, AgentError> {
    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(AgentError::LocalIoError)?,
    );
    // This socket only ever talks to one relay: connect it so `send`/`recv`
    // can be used directly instead of re-specifying `relay_addr` on every call.
    socket
        .connect(relay_addr)
        .await
        .map_err(AgentError::PeerIoError)?;
    socket
        .send(&udp::encode_register_frame(&agent_id))
        .await
        .map_err(AgentError::PeerIoError)?;

    let keep_alive_socket = socket.clone();
    let keep_alive_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(UDP_KEEP_ALIVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; register already sent
        loop {
            ticker.tick().await;
            let frame = udp::encode_keep_alive_frame(&agent_id);
            if keep_alive_socket.send(&frame).await.is_err() {
                break;
            }
        }
    });

    let reader_socket = socket.clone();
    let reader_task = tokio::spawn(run_reader(reader_socket, connections));

    Ok(Arc::new(UdpChannelHandle {
        socket,
        keep_alive_task,
        reader_task,
    }))
}

/// Reads frames from the relay's UDP data channel. Safe to use `recv`
/// rather than `recv_from` since `socket` is connected to `relay_addr`.
async fn run_reader(socket: Arc<UdpSocket>, connections: Arc<ConnectionTable>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "udp data channel recv error");
                continue;
            }
        };
        match udp::decode_udp_frame(&buf[..n]) {
            Some(UdpFrame::Data { conn_id, payload }) => {
                let Some(conn) = connections.get(&conn_id) else {
                    debug!(%conn_id, "udp frame for unknown/expired connection, dropping");
                    continue;
                };
                conn.touch();
                let _ = conn.to_local.send(payload).await;
            }
            _ => {
                debug!("unexpected udp frame shape on data channel, dropping");
            }
        }
    }
}
