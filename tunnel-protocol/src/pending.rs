//! # Pending-Request Correlation Table
//!
//! A sender awaiting a response to a control message keyed by [`RequestId`]
//! registers a waiter here, then completes it when the matching reply
//! arrives, or times it out after a deadline. Generic over the response
//! payload type so both relay and agent share one implementation.

use crate::error::ProtocolError;
use crate::ids::RequestId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub struct PendingRequests<T> {
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<T>>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id` and blocks until either the matching
    /// response arrives (via [`PendingRequests::complete`]) or `deadline`
    /// elapses, in which case the entry is removed and `RequestTimeout` is
    /// returned.
    pub async fn wait(&self, id: RequestId, deadline: Duration) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => {
                self.waiters.lock().unwrap().remove(&id);
                debug!(%id, ?deadline, "request timed out waiting for a correlated response");
                Err(ProtocolError::RequestTimeout(id))
            }
        }
    }

    /// Completes the waiter for `id`, if one is still registered. Returns
    /// `true` if a waiter was found (and thus woken).
    pub fn complete(&self, id: &RequestId, value: T) -> bool {
        if let Some(tx) = self.waiters.lock().unwrap().remove(id) {
            tx.send(value).is_ok()
        } else {
            false
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn completes_before_deadline() {
        let table: Arc<PendingRequests<u32>> = Arc::new(PendingRequests::new());
        let id = RequestId::new();
        let table2 = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(table2.complete(&id, 42));
        });
        let value = table.wait(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn times_out_and_removes_entry() {
        let table: PendingRequests<u32> = PendingRequests::new();
        let id = RequestId::new();
        let err = table.wait(id, Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RequestTimeout(got) if got == id));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn complete_on_unknown_id_is_a_noop() {
        let table: PendingRequests<u32> = PendingRequests::new();
        assert!(!table.complete(&RequestId::new(), 1));
    }
}
