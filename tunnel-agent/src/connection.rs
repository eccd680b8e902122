//! # Agent-Side Connection Table
//!
//! One [`AgentConnection`] per `ExternalConnId` the relay has told this
//! agent about via `NEW_CONNECTION` (`spec §3`, §4.5). `to_local` is a
//! bounded channel: frames arriving from the relay while the local socket
//! is still connecting simply queue here (up to the bound) and are
//! drained once the bridging task starts reading — the "buffer while
//! connecting, replay on connect" behavior `spec §4.5`/§5 ordering
//! guarantee (2) requires. The bound also gives the relay→agent direction
//! the same back-pressure the agent→relay direction already has: once
//! full, `send` blocks its caller, pausing the data-channel reader that
//! feeds it (`spec §9`).

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tunnel_protocol::control::ConnProtocol;
use tunnel_protocol::ExternalConnId;

pub struct AgentConnection {
    pub external_conn_id: ExternalConnId,
    pub protocol: ConnProtocol,
    pub remote_port: u16,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    pub to_local: mpsc::Sender<Bytes>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentConnection {
    pub fn new(
        external_conn_id: ExternalConnId,
        protocol: ConnProtocol,
        remote_port: u16,
        to_local: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            external_conn_id,
            protocol,
            remote_port,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            to_local,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Connections live for the lifetime of one relay connection attempt; a
/// fresh table is built on every reconnect (`spec §4.6` Ready → Disconnected
/// tears down data channels, which implicitly invalidates every connection).
#[derive(Default)]
pub struct ConnectionTable {
    entries: DashMap<ExternalConnId, std::sync::Arc<AgentConnection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: std::sync::Arc<AgentConnection>) {
        self.entries.insert(conn.external_conn_id, conn);
    }

    pub fn get(&self, conn_id: &ExternalConnId) -> Option<std::sync::Arc<AgentConnection>> {
        self.entries.get(conn_id).map(|e| e.clone())
    }

    /// Removes and tears down the connection's bridging tasks. Returns
    /// `true` if a record was present.
    pub fn remove(&self, conn_id: &ExternalConnId) -> bool {
        if let Some((_, conn)) = self.entries.remove(conn_id) {
            conn.abort_tasks();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tears down every tracked connection (reconnect / shutdown).
    pub fn clear(&self) {
        for (_, conn) in self.entries.clone().into_iter() {
            conn.abort_tasks();
        }
        self.entries.clear();
    }

    pub fn iter(&self) -> Vec<std::sync::Arc<AgentConnection>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_reports_presence() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn_id = ExternalConnId::new();
        table.insert(std::sync::Arc::new(AgentConnection::new(
            conn_id,
            ConnProtocol::Tcp,
            29080,
            tx,
        )));
        assert_eq!(table.len(), 1);
        assert!(table.remove(&conn_id));
        assert!(!table.remove(&conn_id));
        assert_eq!(table.len(), 0);
    }
}
