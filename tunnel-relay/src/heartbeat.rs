//! # Heartbeat Sweeper
//!
//! Periodically enumerates authenticated sessions and closes any whose
//! `now - lastHeartbeatAt` exceeds the configured timeout (`spec §4.4`).
//! Closing one session never affects its siblings.

use std::time::Duration;
use tracing::info;

use crate::control::teardown_session;
use crate::state::AppState;

pub async fn run(state: AppState, sweep_interval: Duration, session_timeout: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        ticker.tick().await;
        let expired = state.sessions.expired(session_timeout);
        for session in expired {
            info!(agent_id = %session.agent_id, "heartbeat timeout, closing session");
            teardown_session(&state, session.agent_id).await;
        }
    }
}
