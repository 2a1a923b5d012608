//! Entangled in-process message ports

use super::{MessageListener, MessagePortLike, PostMessage};
use crate::error::ChannelError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct PortState {
    onmessage: Option<MessageListener>,
    /// Messages that arrived before a handler was installed
    queue: VecDeque<Value>,
    closed: bool,
}

#[derive(Default)]
struct PortShared {
    state: Mutex<PortState>,
}

/// Creates pairs of entangled ports
pub struct MessageChannel;

impl MessageChannel {
    /// Two ports; whatever is posted on one is delivered to the other
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let left = Arc::new(PortShared::default());
        let right = Arc::new(PortShared::default());
        (
            MessagePort {
                local: left.clone(),
                peer: Arc::downgrade(&right),
            },
            MessagePort {
                local: right,
                peer: Arc::downgrade(&left),
            },
        )
    }
}

/// One end of a [`MessageChannel`]
///
/// Delivery is synchronous: `post_message` runs the peer's handler before
/// returning. Messages posted while the peer has no handler are queued and
/// drained, in order, when a handler is installed.
#[derive(Clone)]
pub struct MessagePort {
    local: Arc<PortShared>,
    peer: Weak<PortShared>,
}

impl MessagePort {
    pub fn is_closed(&self) -> bool {
        self.local.state.lock().closed
    }

    /// Number of messages waiting for a handler on this port
    pub fn queued(&self) -> usize {
        self.local.state.lock().queue.len()
    }
}

impl PostMessage for MessagePort {
    fn post_message(&self, message: Value) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let peer = self.peer.upgrade().ok_or(ChannelError::Detached)?;

        let handler = {
            let mut state = peer.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            match &state.onmessage {
                Some(handler) => handler.clone(),
                None => {
                    state.queue.push_back(message);
                    return Ok(());
                }
            }
        };

        handler(message);
        Ok(())
    }
}

impl MessagePortLike for MessagePort {
    fn set_onmessage(&self, handler: Option<MessageListener>) {
        let drained: Vec<Value> = {
            let mut state = self.local.state.lock();
            if state.closed {
                return;
            }
            state.onmessage = handler.clone();
            if handler.is_some() {
                state.queue.drain(..).collect()
            } else {
                Vec::new()
            }
        };

        if let Some(handler) = handler {
            for message in drained {
                handler(message);
            }
        }
    }

    fn close(&self) {
        let mut state = self.local.state.lock();
        state.closed = true;
        state.onmessage = None;
        state.queue.clear();
    }
}
