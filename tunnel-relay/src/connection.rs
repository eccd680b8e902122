//! # ConnectionRecord
//!
//! Tracks one external-connection session (`spec §3`): an accepted TCP
//! connection, or a UDP source endpoint not yet timed out. Stored in the
//! owning [`crate::session::AgentSession`]'s connection table, which is
//! partitioned per-agent and written only by that agent's handlers
//! (`spec §5`).

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tunnel_protocol::control::ConnProtocol;
use tunnel_protocol::ExternalConnId;

/// Side-specific handle needed to actually move bytes to/from the
/// external peer of a connection.
pub enum ConnectionOwner {
    /// A bridged raw/HTTP/WebSocket TCP connection. `to_external` is the
    /// bounded channel the TCP data-channel reader pushes inbound frame
    /// payloads into; its own backpressure is what pauses the shared
    /// data-channel reader when this one external socket can't keep up
    /// (`spec §4.5`).
    Tcp {
        to_external: mpsc::Sender<Bytes>,
        tasks: Mutex<Vec<JoinHandle<()>>>,
    },
    /// A UDP "session" keyed by peer address on one exposed port. Carries
    /// the exposed port's own `UdpSocket` so inbound data frames from the
    /// agent can be written straight back to `peer_addr` without a second
    /// lookup table.
    Udp {
        peer_addr: SocketAddr,
        socket: std::sync::Arc<tokio::net::UdpSocket>,
    },
}

pub struct ConnectionRecord {
    pub external_conn_id: ExternalConnId,
    pub peer_addr: SocketAddr,
    pub protocol: ConnProtocol,
    pub port: u16,
    pub created_at: Instant,
    pub last_activity: Mutex<Instant>,
    pub owner: ConnectionOwner,
}

impl ConnectionRecord {
    pub fn new_tcp(
        external_conn_id: ExternalConnId,
        peer_addr: SocketAddr,
        protocol: ConnProtocol,
        port: u16,
        to_external: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            external_conn_id,
            peer_addr,
            protocol,
            port,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            owner: ConnectionOwner::Tcp {
                to_external,
                tasks: Mutex::new(Vec::new()),
            },
        }
    }

    pub fn new_udp(
        external_conn_id: ExternalConnId,
        peer_addr: SocketAddr,
        port: u16,
        socket: std::sync::Arc<tokio::net::UdpSocket>,
    ) -> Self {
        Self {
            external_conn_id,
            peer_addr,
            protocol: ConnProtocol::Udp,
            port,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            owner: ConnectionOwner::Udp { peer_addr, socket },
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Aborts any tasks bridging bytes for this connection (TCP side only).
    pub fn abort_tasks(&self) {
        if let ConnectionOwner::Tcp { tasks, .. } = &self.owner {
            for handle in tasks.lock().unwrap().drain(..) {
                handle.abort();
            }
        }
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        if let ConnectionOwner::Tcp { tasks, .. } = &self.owner {
            tasks.lock().unwrap().push(handle);
        }
    }
}
