//! # Exposed-Port Registry
//!
//! Maps an exposed port to the single agent that owns it (`spec §3`,
//! §4.4). Shared across sessions behind one `DashMap`, matching the
//! teacher's `AppState` registries — this is the single serialization
//! boundary for port ownership (`spec §5`).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tunnel_protocol::AgentId;

use crate::error::RelayError;

#[derive(Default)]
pub struct PortRegistry {
    owners: DashMap<u16, AgentId>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `port` to `agent_id`. Re-registering a port you already
    /// own succeeds (idempotent). Registering a port owned by a different
    /// agent fails with `PortAlreadyRegistered`.
    pub fn register(&self, port: u16, agent_id: AgentId) -> Result<(), RelayError> {
        match self.owners.entry(port) {
            Entry::Occupied(e) if *e.get() == agent_id => Ok(()),
            Entry::Occupied(_) => Err(RelayError::PortAlreadyRegistered(port)),
            Entry::Vacant(e) => {
                e.insert(agent_id);
                Ok(())
            }
        }
    }

    /// Releases `port`, but only if `agent_id` is the current owner.
    pub fn unregister(&self, port: u16, agent_id: AgentId) -> Result<(), RelayError> {
        match self.owners.get(&port) {
            Some(owner) if *owner == agent_id => {
                drop(owner);
                self.owners.remove(&port);
                Ok(())
            }
            _ => Err(RelayError::UnknownPort(port)),
        }
    }

    pub fn owner_of(&self, port: u16) -> Option<AgentId> {
        self.owners.get(&port).map(|e| *e)
    }

    /// Ports currently owned by `agent_id`, for admin status queries.
    pub fn ports_for(&self, agent_id: AgentId) -> Vec<u16> {
        self.owners
            .iter()
            .filter(|e| *e.value() == agent_id)
            .map(|e| *e.key())
            .collect()
    }

    /// Releases every port owned by `agent_id` (session-removal cascade,
    /// `spec §3`). Returns the released ports.
    pub fn release_all_for(&self, agent_id: AgentId) -> Vec<u16> {
        let released: Vec<u16> = self
            .owners
            .iter()
            .filter(|e| *e.value() == agent_id)
            .map(|e| *e.key())
            .collect();
        for port in &released {
            self.owners.remove(port);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_foreign_owner_and_allows_self_reregister() {
        let registry = PortRegistry::new();
        let a = AgentId::new();
        let b = AgentId::new();
        assert!(registry.register(29080, a).is_ok());
        assert!(matches!(
            registry.register(29080, b),
            Err(RelayError::PortAlreadyRegistered(29080))
        ));
        assert!(registry.register(29080, a).is_ok());
    }

    #[test]
    fn unregister_is_idempotent_after_first_success() {
        let registry = PortRegistry::new();
        let a = AgentId::new();
        registry.register(29080, a).unwrap();
        assert!(registry.unregister(29080, a).is_ok());
        assert!(matches!(
            registry.unregister(29080, a),
            Err(RelayError::UnknownPort(29080))
        ));
    }

    #[test]
    fn release_all_for_only_touches_owned_ports() {
        let registry = PortRegistry::new();
        let a = AgentId::new();
        let b = AgentId::new();
        registry.register(29080, a).unwrap();
        registry.register(29081, b).unwrap();
        let released = registry.release_all_for(a);
        assert_eq!(released, vec![29080]);
        assert_eq!(registry.owner_of(29080), None);
        assert_eq!(registry.owner_of(29081), Some(b));
    }
}
