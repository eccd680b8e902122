//! # Agent Session Registry
//!
//! An [`AgentSession`] exists from successful `AUTH` until the control
//! socket closes or the heartbeat sweeper expires it (`spec §3`). At most
//! one active control socket exists per `AgentId` at any time.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tunnel_protocol::{AgentId, ControlMessage, ExternalConnId};

use crate::connection::ConnectionRecord;
use crate::data_channel::TcpDataChannelHandle;

/// One authenticated agent's control socket and everything it owns.
pub struct AgentSession {
    pub agent_id: AgentId,
    /// Outbound control messages queued to this agent's WebSocket writer.
    pub control_tx: mpsc::UnboundedSender<ControlMessage>,
    pub authenticated_at: Instant,
    last_heartbeat_at: StdMutex<Instant>,
    /// Connection table for this agent, partitioned per-agent per `spec §5`.
    pub connections: DashMap<ExternalConnId, ConnectionRecord>,
    pub tcp_data_channel: StdMutex<Option<Arc<TcpDataChannelHandle>>>,
    data_channel_generation: AtomicU64,
    /// Closes the owning `handle_connection` task's WebSocket when fired,
    /// so a session torn down out-of-band (heartbeat eviction) doesn't leak
    /// the socket it came in on. Set once, on successful `AUTH`.
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl AgentSession {
    pub fn new(agent_id: AgentId, control_tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            agent_id,
            control_tx,
            authenticated_at: Instant::now(),
            last_heartbeat_at: StdMutex::new(Instant::now()),
            connections: DashMap::new(),
            tcp_data_channel: StdMutex::new(None),
            data_channel_generation: AtomicU64::new(0),
            shutdown_tx: StdMutex::new(None),
        }
    }

    /// Stores the `handle_connection` close signal. Called once, right
    /// after authentication succeeds.
    pub fn set_shutdown_signal(&self, tx: oneshot::Sender<()>) {
        *self.shutdown_tx.lock().unwrap() = Some(tx);
    }

    /// Fires the stored close signal, if any. Safe to call more than once
    /// or after the receiving task has already exited.
    pub fn fire_shutdown_signal(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Allocates the next data-channel generation id. The reader task that
    /// eventually exits compares its generation against the session's
    /// current one before clearing `tcp_data_channel`, so a stale reader
    /// can never clobber a channel that has since replaced it.
    pub fn bump_data_channel_generation(&self) -> u64 {
        self.data_channel_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_data_channel_if_current(&self, generation: u64) {
        if self.data_channel_generation.load(Ordering::SeqCst) == generation {
            self.tcp_data_channel.lock().unwrap().take();
        }
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.lock().unwrap() = Instant::now();
    }

    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat_at.lock().unwrap().elapsed()
    }

    pub fn send(&self, msg: ControlMessage) {
        let _ = self.control_tx.send(msg);
    }

    /// Replaces the TCP data channel, returning the old one (if any) so
    /// the caller can tear it down outside any lock it might hold.
    pub fn replace_data_channel(
        &self,
        handle: Option<Arc<TcpDataChannelHandle>>,
    ) -> Option<Arc<TcpDataChannelHandle>> {
        std::mem::replace(&mut self.tcp_data_channel.lock().unwrap(), handle)
    }

    pub fn has_data_channel(&self) -> bool {
        self.tcp_data_channel.lock().unwrap().is_some()
    }

    /// Clones out the current data channel handle, if any, so the caller can
    /// send on its bounded queue without holding the session's lock across
    /// an `.await`.
    pub fn data_channel(&self) -> Option<Arc<TcpDataChannelHandle>> {
        self.tcp_data_channel.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<AgentId, std::sync::Arc<AgentSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: std::sync::Arc<AgentSession>) {
        self.sessions.insert(session.agent_id, session);
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<std::sync::Arc<AgentSession>> {
        self.sessions.get(agent_id).map(|e| e.clone())
    }

    pub fn remove(&self, agent_id: &AgentId) -> Option<std::sync::Arc<AgentSession>> {
        self.sessions.remove(agent_id).map(|(_, s)| s)
    }

    pub fn is_authenticated(&self, agent_id: &AgentId) -> bool {
        self.sessions.contains_key(agent_id)
    }

    /// Returns every session whose heartbeat is older than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<std::sync::Arc<AgentSession>> {
        self.sessions
            .iter()
            .filter(|e| e.value().since_last_heartbeat() > timeout)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of every currently authenticated session, for admin
    /// status queries.
    pub fn iter(&self) -> Vec<std::sync::Arc<AgentSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_session() -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(AgentSession::new(AgentId::new(), tx))
    }

    #[test]
    fn at_most_one_session_per_agent_id() {
        let registry = SessionRegistry::new();
        let session = new_session();
        let agent_id = session.agent_id;
        registry.insert(session);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.insert(Arc::new(AgentSession::new(agent_id, tx2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn expired_respects_heartbeat_timeout() {
        let registry = SessionRegistry::new();
        let session = new_session();
        registry.insert(session.clone());
        assert!(registry.expired(Duration::from_secs(0)).len() <= 1);
        assert!(registry
            .expired(Duration::from_secs(120))
            .is_empty());
    }
}
