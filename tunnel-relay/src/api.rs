//! # Admin Read-Only Endpoints
//!
//! A thin read-only status surface over the session/port registries
//! (`spec §6`: "administrative side channel"). The full admin UI and its
//! mutating endpoints (disconnect agent, cleanup orphan ports) are
//! boundary-only consumers outside the core engine; this module exposes
//! just enough for the core's own registries to be inspected.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub authenticated_secs_ago: u64,
    pub owned_ports: Vec<u16>,
    pub connection_count: usize,
}

/// `GET /api/agents` — lists every authenticated agent session, its
/// owned exposed ports, and its live connection count.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    let agents: Vec<AgentStatus> = state
        .sessions
        .iter()
        .map(|session| AgentStatus {
            agent_id: session.agent_id.to_string(),
            authenticated_secs_ago: session.authenticated_at.elapsed().as_secs(),
            owned_ports: state
                .ports
                .ports_for(session.agent_id),
            connection_count: session.connections.len(),
        })
        .collect();
    Json(agents)
}
