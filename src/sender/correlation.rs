//! In-flight request correlation
//!
//! Removing an entry from the table is the only way to settle a call, so
//! whichever of response, error or timeout gets there first wins and every
//! later attempt is a no-op.

use crate::envelope::ErrorBody;
use crate::error::{Result, TetherError};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

struct PendingCall {
    name: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// Pending calls keyed by correlation id
#[derive(Default)]
pub(crate) struct CorrelationTable {
    pending: DashMap<String, PendingCall>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a call; the returned receiver yields its single settlement
    pub(crate) fn register(&self, id: &str, name: &str) -> oneshot::Receiver<Result<Value>> {
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            id.to_string(),
            PendingCall {
                name: name.to_string(),
                reply,
            },
        );
        rx
    }

    pub(crate) fn resolve(&self, id: &str, body: Value) -> bool {
        self.settle(id, Ok(body))
    }

    pub(crate) fn reject(&self, id: &str, error: ErrorBody) -> bool {
        self.settle(id, Err(TetherError::Remote(error)))
    }

    /// Forget a call without settling it
    pub(crate) fn discard(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Settle every pending call with an error built by `make`
    pub(crate) fn reject_all(&self, make: impl Fn() -> TetherError) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.settle(id, Err(make()))).count()
    }

    /// Name of the call pending under `id`
    #[cfg(test)]
    pub(crate) fn name_of(&self, id: &str) -> Option<String> {
        self.pending.get(id).map(|call| call.name.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    fn settle(&self, id: &str, outcome: Result<Value>) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                debug!(id = %id, name = %call.name, ok = outcome.is_ok(), "Call settled");
                // The caller may have gone away; the entry is gone either way
                let _ = call.reply.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Discards a pending call when the awaiting future is dropped
pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a CorrelationTable, id: &'a str) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.discard(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let table = CorrelationTable::new();
        let rx = table.register("1", "ping");
        assert_eq!(table.len(), 1);
        assert_eq!(table.name_of("1").as_deref(), Some("ping"));

        assert!(table.resolve("1", json!("pong")));
        assert!(!table.resolve("1", json!("again")));
        assert!(!table.reject("1", ErrorBody::new("late")));
        assert_eq!(table.len(), 0);

        assert_eq!(rx.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_reject_carries_error_body() {
        let table = CorrelationTable::new();
        let rx = table.register("1", "missing");
        assert!(table.reject("1", ErrorBody::not_found("missing")));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Request \"missing\" not found");
        assert_eq!(err.remote().map(|b| b.name.as_str()), Some("HandlerNotFound"));
    }

    #[test]
    fn test_discard_makes_late_reply_a_noop() {
        let table = CorrelationTable::new();
        let _rx = table.register("1", "slow");
        assert!(table.discard("1"));
        assert!(!table.resolve("1", json!(1)));
        assert!(!table.discard("1"));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let table = CorrelationTable::new();
        let a = table.register("a", "one");
        let b = table.register("b", "two");

        assert_eq!(table.reject_all(|| TetherError::Shutdown), 2);
        assert_eq!(table.len(), 0);
        assert!(matches!(a.await.unwrap(), Err(TetherError::Shutdown)));
        assert!(matches!(b.await.unwrap(), Err(TetherError::Shutdown)));
    }

    #[test]
    fn test_settle_after_receiver_dropped() {
        let table = CorrelationTable::new();
        drop(table.register("1", "gone"));
        assert!(table.resolve("1", json!(null)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_guard_discards_on_drop() {
        let table = CorrelationTable::new();
        let _rx = table.register("1", "dropped");
        {
            let _guard = PendingGuard::new(&table, "1");
        }
        assert_eq!(table.len(), 0);
    }
}
