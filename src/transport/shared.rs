//! Window-like shared target

use super::{EventTarget, ListenerId, MessageListener, PostMessage};
use crate::error::ChannelError;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct SharedInner {
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
    next_listener: AtomicU64,
}

/// A target every party posts to and listens on
///
/// Each post is delivered to every registered listener, including the
/// poster's own. Endpoints sharing one target therefore see their own
/// envelopes and must filter them. Closing is a no-op.
#[derive(Clone, Default)]
pub struct SharedTarget {
    inner: Arc<SharedInner>,
}

impl SharedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl PostMessage for SharedTarget {
    fn post_message(&self, message: Value) -> Result<(), ChannelError> {
        let listeners: Vec<MessageListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(message.clone());
        }
        Ok(())
    }
}

impl EventTarget for SharedTarget {
    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId::new(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }
}
