//! Transport adapter
//!
//! Normalises the channel kinds an endpoint can be connected to into one
//! uniform "post a message / receive messages" capability. The strategy is an
//! explicit [`Target`] variant chosen by the caller at connect time.
//!
//! In-process channel implementations:
//! - [`MessageChannel`] / [`MessagePort`]: entangled point-to-point ports
//! - [`BroadcastHub`] / [`BroadcastChannel`]: named multi-listener channels
//! - [`SharedTarget`]: window-like target, every listener sees every post

mod broadcast;
mod port;
mod shared;

pub use broadcast::{BroadcastChannel, BroadcastHub};
pub use port::{MessageChannel, MessagePort};
pub use shared::SharedTarget;

use crate::error::{ChannelError, Result, TetherError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Callback invoked with every message a channel delivers
pub type MessageListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle of a listener registered on an [`EventTarget`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Anything that can carry an opaque message to the other side
pub trait PostMessage: Send + Sync {
    fn post_message(&self, message: Value) -> std::result::Result<(), ChannelError>;
}

/// Multi-listener channel with add/remove registration
pub trait EventTarget: PostMessage {
    fn add_listener(&self, listener: MessageListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Release the channel. Targets that cannot be closed ignore this.
    fn close(&self) {}
}

/// Point-to-point port with a single message-handler slot
pub trait MessagePortLike: PostMessage {
    /// Replace the handler slot; `None` clears it
    fn set_onmessage(&self, handler: Option<MessageListener>);

    fn close(&self);
}

/// Channel handed to `connect`, tagged with the strategy to drive it
#[derive(Clone)]
pub enum Target {
    /// Broadcast-style channel; listeners via add/remove, closed on teardown
    Broadcast(Arc<dyn EventTarget>),
    /// Port-style channel; single handler slot, closed on teardown
    Port(Arc<dyn MessagePortLike>),
    /// Generic listener-registration target; never closed by the endpoint
    Listener(Arc<dyn EventTarget>),
    /// Can post but exposes no receive capability
    PostOnly(Arc<dyn PostMessage>),
}

impl Target {
    pub fn kind(&self) -> TransportKind {
        match self {
            Target::Broadcast(_) => TransportKind::Broadcast,
            Target::Port(_) => TransportKind::Port,
            Target::Listener(_) => TransportKind::Listener,
            Target::PostOnly(_) => TransportKind::PostOnly,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target::{:?}", self.kind())
    }
}

impl From<MessagePort> for Target {
    fn from(port: MessagePort) -> Self {
        Target::Port(Arc::new(port))
    }
}

impl From<BroadcastChannel> for Target {
    fn from(channel: BroadcastChannel) -> Self {
        Target::Broadcast(Arc::new(channel))
    }
}

impl From<SharedTarget> for Target {
    fn from(target: SharedTarget) -> Self {
        Target::Listener(Arc::new(target))
    }
}

/// Strategy tag of a target / transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Broadcast,
    Port,
    Listener,
    PostOnly,
}

impl TransportKind {
    /// Whether teardown should close the underlying channel
    pub fn can_close(self) -> bool {
        matches!(self, TransportKind::Broadcast | TransportKind::Port)
    }
}

enum Strategy {
    Listener(Arc<dyn EventTarget>),
    Port(Arc<dyn MessagePortLike>),
}

/// Uniform send/receive capability over one connected target
pub struct Transport {
    kind: TransportKind,
    strategy: Strategy,
    registration: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

impl Transport {
    /// Pick the adapter for `target`. Post-only targets are refused with
    /// `TransportUnsupported`; the caller may retry with another target.
    pub fn connect(target: Target) -> Result<Self> {
        let kind = target.kind();
        let strategy = match target {
            Target::Broadcast(t) | Target::Listener(t) => Strategy::Listener(t),
            Target::Port(p) => Strategy::Port(p),
            Target::PostOnly(_) => {
                return Err(TetherError::TransportUnsupported(
                    "target exposes neither listener registration nor a message port".to_string(),
                ));
            }
        };

        Ok(Self {
            kind,
            strategy,
            registration: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Post one message on the channel
    pub fn send(&self, message: Value) -> std::result::Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match &self.strategy {
            Strategy::Listener(t) => t.post_message(message),
            Strategy::Port(p) => p.post_message(message),
        }
    }

    /// Route every received message to `listener`, replacing any previous one
    pub fn on_receive(&self, listener: MessageListener) {
        match &self.strategy {
            Strategy::Listener(t) => {
                let mut registration = self.registration.lock();
                if let Some(previous) = registration.take() {
                    t.remove_listener(previous);
                }
                *registration = Some(t.add_listener(listener));
            }
            Strategy::Port(p) => p.set_onmessage(Some(listener)),
        }
    }

    /// Stop delivering received messages
    pub fn stop_receiving(&self) {
        match &self.strategy {
            Strategy::Listener(t) => {
                if let Some(id) = self.registration.lock().take() {
                    t.remove_listener(id);
                }
            }
            Strategy::Port(p) => p.set_onmessage(None),
        }
    }

    /// Stop receiving and release the channel if its kind supports closing.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_receiving();
        if !self.kind.can_close() {
            return;
        }
        debug!(kind = ?self.kind, "Closing channel");
        match &self.strategy {
            Strategy::Listener(t) => t.close(),
            Strategy::Port(p) => p.close(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Sink;

    impl PostMessage for Sink {
        fn post_message(&self, _message: Value) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
    }

    fn collector() -> (MessageListener, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: MessageListener = Arc::new(move |msg| sink.lock().push(msg));
        (listener, seen)
    }

    #[test]
    fn test_post_only_is_unsupported() {
        let result = Transport::connect(Target::PostOnly(Arc::new(Sink)));
        assert!(matches!(result, Err(TetherError::TransportUnsupported(_))));
    }

    #[test]
    fn test_kind_can_close() {
        assert!(TransportKind::Broadcast.can_close());
        assert!(TransportKind::Port.can_close());
        assert!(!TransportKind::Listener.can_close());
        assert!(!TransportKind::PostOnly.can_close());
    }

    #[test]
    fn test_port_transport_round_trip() {
        let (a, b) = MessageChannel::new();
        let left = Transport::connect(a.into()).unwrap();
        let right = Transport::connect(b.into()).unwrap();
        assert_eq!(left.kind(), TransportKind::Port);

        let (listener, seen) = collector();
        right.on_receive(listener);
        left.send(json!({"n": 1})).unwrap();

        assert_eq!(*seen.lock(), vec![json!({"n": 1})]);
    }

    #[test]
    fn test_listener_registration_is_replaced() {
        let shared = SharedTarget::new();
        let transport = Transport::connect(shared.clone().into()).unwrap();

        let (first, first_seen) = collector();
        let (second, second_seen) = collector();
        transport.on_receive(first);
        transport.on_receive(second);
        assert_eq!(shared.listener_count(), 1);

        shared.post_message(json!("hello")).unwrap();
        assert!(first_seen.lock().is_empty());
        assert_eq!(*second_seen.lock(), vec![json!("hello")]);

        transport.stop_receiving();
        assert_eq!(shared.listener_count(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_send() {
        let (a, _b) = MessageChannel::new();
        let transport = Transport::connect(a.into()).unwrap();
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(transport.send(json!(1)), Err(ChannelError::Closed));
    }

    #[test]
    fn test_listener_target_is_not_closed() {
        let shared = SharedTarget::new();
        let transport = Transport::connect(shared.clone().into()).unwrap();
        transport.on_receive(Arc::new(|_| {}));
        transport.close();

        // The shared target stays usable for others
        let (listener, seen) = collector();
        shared.add_listener(listener);
        shared.post_message(json!(true)).unwrap();
        assert_eq!(*seen.lock(), vec![json!(true)]);
    }
}
