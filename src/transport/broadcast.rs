//! Named broadcast channels
//!
//! A [`BroadcastHub`] is the scope channels are looked up in. Posting on a
//! channel delivers to the listeners of every other open channel with the
//! same name in the same hub, never back to the poster. Channels keep their
//! hub alive.

use super::{EventTarget, ListenerId, MessageListener, PostMessage};
use crate::error::ChannelError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct HubInner {
    channels: Mutex<HashMap<String, Vec<Weak<ChannelShared>>>>,
}

/// Registry of broadcast channels, by name
#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel instance on `name`
    pub fn open(&self, name: &str) -> BroadcastChannel {
        let shared = Arc::new(ChannelShared {
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        self.inner
            .channels
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Arc::downgrade(&shared));

        BroadcastChannel {
            name: name.to_string(),
            shared,
            hub: self.inner.clone(),
        }
    }

    /// Number of open channel instances on `name`
    pub fn open_count(&self, name: &str) -> usize {
        let mut channels = self.inner.channels.lock();
        match channels.get_mut(name) {
            Some(members) => {
                members.retain(|m| m.upgrade().is_some_and(|c| !c.closed.load(Ordering::SeqCst)));
                members.len()
            }
            None => 0,
        }
    }
}

struct ChannelShared {
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

/// One instance of a named broadcast channel
#[derive(Clone)]
pub struct BroadcastChannel {
    name: String,
    shared: Arc<ChannelShared>,
    hub: Arc<HubInner>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl PostMessage for BroadcastChannel {
    fn post_message(&self, message: Value) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let listeners: Vec<MessageListener> = {
            let mut channels = self.hub.channels.lock();
            let Some(members) = channels.get_mut(&self.name) else {
                return Ok(());
            };
            members.retain(|m| m.strong_count() > 0);
            members
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|peer| !Arc::ptr_eq(peer, &self.shared) && !peer.closed.load(Ordering::SeqCst))
                .flat_map(|peer| {
                    peer.listeners
                        .lock()
                        .iter()
                        .map(|(_, l)| l.clone())
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for listener in listeners {
            listener(message.clone());
        }
        Ok(())
    }
}

impl EventTarget for BroadcastChannel {
    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId::new(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));
        self.shared.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.listeners.lock().clear();
        if let Some(members) = self.hub.channels.lock().get_mut(&self.name) {
            members.retain(|m| !std::ptr::eq(m.as_ptr(), Arc::as_ptr(&self.shared)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector() -> (MessageListener, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: MessageListener = Arc::new(move |msg| sink.lock().push(msg));
        (listener, seen)
    }

    #[test]
    fn test_broadcast_skips_poster() {
        let hub = BroadcastHub::new();
        let a = hub.open("bridge");
        let b = hub.open("bridge");
        let c = hub.open("bridge");

        let (on_a, seen_a) = collector();
        let (on_b, seen_b) = collector();
        let (on_c, seen_c) = collector();
        a.add_listener(on_a);
        b.add_listener(on_b);
        c.add_listener(on_c);

        a.post_message(json!("hi")).unwrap();

        assert!(seen_a.lock().is_empty());
        assert_eq!(*seen_b.lock(), vec![json!("hi")]);
        assert_eq!(*seen_c.lock(), vec![json!("hi")]);
    }

    #[test]
    fn test_names_are_isolated() {
        let hub = BroadcastHub::new();
        let a = hub.open("one");
        let b = hub.open("two");
        let (on_b, seen_b) = collector();
        b.add_listener(on_b);

        a.post_message(json!(1)).unwrap();
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_hubs_are_isolated() {
        let first = BroadcastHub::new();
        let second = BroadcastHub::new();
        let a = first.open("bridge");
        let b = second.open("bridge");
        let (on_b, seen_b) = collector();
        b.add_listener(on_b);

        a.post_message(json!(1)).unwrap();
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_remove_listener() {
        let hub = BroadcastHub::new();
        let a = hub.open("bridge");
        let b = hub.open("bridge");
        let (on_b, seen_b) = collector();
        let id = b.add_listener(on_b);
        b.remove_listener(id);

        a.post_message(json!(1)).unwrap();
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_close_leaves_hub() {
        let hub = BroadcastHub::new();
        let a = hub.open("bridge");
        let b = hub.open("bridge");
        assert_eq!(hub.open_count("bridge"), 2);

        b.close();
        assert_eq!(hub.open_count("bridge"), 1);
        assert_eq!(b.post_message(json!(1)), Err(ChannelError::Closed));
        assert!(a.post_message(json!(1)).is_ok());
    }

    #[test]
    fn test_channels_outlive_hub_handle() {
        let hub = BroadcastHub::new();
        let a = hub.open("bridge");
        let b = hub.open("bridge");
        drop(hub);

        let (on_b, seen_b) = collector();
        b.add_listener(on_b);
        a.post_message(json!(1)).unwrap();
        assert_eq!(*seen_b.lock(), vec![json!(1)]);
    }

    #[test]
    fn test_dropped_channels_are_pruned() {
        let hub = BroadcastHub::new();
        let _a = hub.open("bridge");
        {
            let _b = hub.open("bridge");
        }
        assert_eq!(hub.open_count("bridge"), 1);
    }
}
