//! # UDP Data-Channel Manager (relay side)
//!
//! The control port's UDP socket doubles as the agent-facing data channel
//! for UDP-forwarded traffic (`spec §4.2`). An agent sends `REGISTER`/
//! `KEEP_ALIVE` datagrams from whatever local port it is bound to; the
//! relay remembers that endpoint per `AgentId` and rewrites it whenever a
//! later datagram arrives from a different source address, so NAT
//! rebinding on the agent side never wedges the channel (`spec §4.2`,
//! Edge cases).

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use tunnel_protocol::udp::{self, UdpFrame};
use tunnel_protocol::{frame, AgentId};

use crate::connection::ConnectionOwner;
use crate::session::SessionRegistry;

/// Owns the control port's UDP socket and the agent-endpoint mapping.
/// Per-exposed-port UDP proxies hold an `Arc` of this to send data frames
/// toward an agent; inbound frames from agents are read back out by
/// [`UdpChannelManager::run`].
pub struct UdpChannelManager {
    socket: Arc<UdpSocket>,
    agent_endpoints: DashMap<AgentId, SocketAddr>,
    endpoint_agents: DashMap<SocketAddr, AgentId>,
}

impl UdpChannelManager {
    pub fn new(socket: Arc<UdpSocket>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            agent_endpoints: DashMap::new(),
            endpoint_agents: DashMap::new(),
        })
    }

    fn rebind(&self, agent_id: AgentId, addr: SocketAddr) {
        if let Some(prev) = self.agent_endpoints.insert(agent_id, addr) {
            if prev != addr {
                self.endpoint_agents.remove(&prev);
            }
        }
        self.endpoint_agents.insert(addr, agent_id);
    }

    /// Sends a data frame to the agent's last-known UDP endpoint. Returns
    /// `false` if the agent has never registered an endpoint.
    pub async fn send_to_agent(
        &self,
        agent_id: &AgentId,
        conn_id_wire: &[u8; tunnel_protocol::ID_WIRE_LEN],
        payload: &[u8],
    ) -> bool {
        let Some(addr) = self.agent_endpoints.get(agent_id).map(|e| *e) else {
            return false;
        };
        let frame = udp::encode_data_frame(conn_id_wire, payload);
        self.socket.send_to(&frame, addr).await.is_ok()
    }

    /// Runs the receive loop for the control port's UDP socket. Handles
    /// `REGISTER`/`KEEP_ALIVE` bookkeeping directly and routes `Data`
    /// frames to the owning connection's exposed-port socket.
    pub async fn run(self: Arc<Self>, sessions: Arc<SessionRegistry>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "udp control socket recv error");
                    continue;
                }
            };

            match udp::decode_udp_frame(&buf[..n]) {
                Some(UdpFrame::Register { agent_id }) => {
                    if !sessions.is_authenticated(&agent_id) {
                        debug!(%agent_id, %addr, "udp register for unknown agent, dropping");
                        continue;
                    }
                    self.rebind(agent_id, addr);
                    let _ = self.socket.send_to(&[frame::AUTH_ACCEPT], addr).await;
                }
                Some(UdpFrame::KeepAlive { agent_id }) => {
                    if !sessions.is_authenticated(&agent_id) {
                        debug!(%agent_id, %addr, "udp keepalive for unknown agent, dropping");
                        continue;
                    }
                    self.rebind(agent_id, addr);
                }
                Some(UdpFrame::Data { conn_id, payload }) => {
                    let Some(agent_id) = self.endpoint_agents.get(&addr).map(|e| *e) else {
                        debug!(%addr, "udp data frame from unregistered endpoint, dropping");
                        continue;
                    };
                    let Some(session) = sessions.get(&agent_id) else {
                        continue;
                    };
                    let Some(record) = session.connections.get(&conn_id) else {
                        debug!(%conn_id, "udp data frame for unknown/expired connection, dropping");
                        continue;
                    };
                    if let ConnectionOwner::Udp { peer_addr, socket } = &record.owner {
                        record.touch();
                        if let Err(e) = socket.send_to(payload, *peer_addr).await {
                            debug!(error = %e, %conn_id, "failed to forward udp frame to peer");
                        }
                    }
                }
                None => {
                    debug!(%addr, "malformed udp control-port datagram, dropping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rebind_updates_reverse_index() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mgr = UdpChannelManager::new(socket);
        let agent_id = AgentId::new();
        let addr1: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let addr2: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        mgr.rebind(agent_id, addr1);
        assert_eq!(mgr.endpoint_agents.get(&addr1).map(|e| *e), Some(agent_id));

        mgr.rebind(agent_id, addr2);
        assert_eq!(mgr.endpoint_agents.get(&addr2).map(|e| *e), Some(agent_id));
        assert!(mgr.endpoint_agents.get(&addr1).is_none());
        assert_eq!(mgr.agent_endpoints.get(&agent_id).map(|e| *e), Some(addr2));
    }

    #[tokio::test]
    async fn send_to_agent_without_endpoint_fails() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mgr = UdpChannelManager::new(socket);
        let agent_id = AgentId::new();
        let conn_id = tunnel_protocol::ExternalConnId::new();
        assert!(!mgr
            .send_to_agent(&agent_id, &conn_id.to_wire_bytes(), b"hi")
            .await);
    }
}
