//! Local side of remote subscriptions

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with the body of every event of a subscription
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct SubscriptionEntry {
    name: String,
    options: Value,
    callback: EventCallback,
}

/// Active subscriptions by id
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: &str, name: &str, options: Value, callback: EventCallback) {
        self.entries.lock().insert(
            id.to_string(),
            SubscriptionEntry {
                name: name.to_string(),
                options,
                callback,
            },
        );
    }

    /// Drop a subscription, returning its name and options
    pub(crate) fn remove(&self, id: &str) -> Option<(String, Value)> {
        self.entries
            .lock()
            .remove(id)
            .map(|entry| (entry.name, entry.options))
    }

    /// Deliver an event body; false when the id is unknown
    pub(crate) fn dispatch(&self, id: &str, body: Value) -> bool {
        let callback = match self.entries.lock().get(id) {
            Some(entry) => entry.callback.clone(),
            None => return false,
        };
        callback(body);
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Drop every subscription, returning how many there were
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
