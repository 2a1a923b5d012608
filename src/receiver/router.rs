//! Request routing for the receiving endpoint
//!
//! Handlers are registered by kind and name, with one wildcard slot per kind.
//! Every request and subscription envelope gets exactly one handler call or
//! one error reply; nothing a handler does can take the router down.

use super::pattern::NamePattern;
use crate::envelope::{encode_envelope, Envelope, EnvelopeType, ErrorBody, SubscriptionAction};
use crate::error::Result;
use crate::transport::Transport;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name that fills the wildcard slot of a handler kind
pub const WILDCARD: &str = "*";

/// Handler invoked with the incoming envelope and a way to answer it
pub type Handler = Arc<dyn Fn(Envelope, Responder) -> anyhow::Result<()> + Send + Sync>;

/// Which envelopes a handler answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Request,
    Subscribe,
    Unsubscribe,
}

const ALL_KINDS: [HandlerKind; 3] = [
    HandlerKind::Request,
    HandlerKind::Subscribe,
    HandlerKind::Unsubscribe,
];

/// Handler group selected by `remove_handler`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    Request,
    /// Both subscribe and unsubscribe handlers
    Subscription,
}

impl RemovalKind {
    fn kinds(self) -> &'static [HandlerKind] {
        match self {
            RemovalKind::Request => &[HandlerKind::Request],
            RemovalKind::Subscription => &[HandlerKind::Subscribe, HandlerKind::Unsubscribe],
        }
    }
}

/// Where replies go: the connected transport and our endpoint id
#[derive(Clone)]
pub(crate) struct Outlet {
    transport: Arc<Transport>,
    receiver_id: Arc<str>,
}

impl Outlet {
    pub(crate) fn new(transport: Arc<Transport>, receiver_id: Arc<str>) -> Self {
        Self {
            transport,
            receiver_id,
        }
    }
}

/// Answers one request or feeds one subscription
///
/// Cloneable and `'static`, so handlers can move it into a spawned task and
/// keep sending events for as long as the subscription lives.
#[derive(Clone)]
pub struct Responder {
    outlet: Outlet,
    id: String,
    sender_id: Option<String>,
    name: String,
    /// `response` for requests, `event` for subscriptions
    success: EnvelopeType,
}

impl Responder {
    /// Correlation id of the request or subscription
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this answers a subscription (sends are events)
    pub fn is_subscription(&self) -> bool {
        self.success == EnvelopeType::Event
    }

    /// Send a successful reply, or an event for subscriptions
    pub fn send(&self, body: Value) -> Result<()> {
        self.post(self.success, body)
    }

    /// Serialize and send
    pub fn reply<T: Serialize>(&self, body: &T) -> Result<()> {
        self.send(serde_json::to_value(body)?)
    }

    /// Send an error reply
    pub fn fail(&self, error: ErrorBody) -> Result<()> {
        self.post(EnvelopeType::Error, error.to_value())
    }

    fn post(&self, kind: EnvelopeType, body: Value) -> Result<()> {
        let mut envelope = Envelope::new(kind, self.id.clone(), self.name.clone(), body)
            .with_receiver(&*self.outlet.receiver_id);
        envelope.sender_id = self.sender_id.clone();

        let frame = encode_envelope(&envelope)?;
        self.outlet.transport.send(frame)?;
        Ok(())
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.success)
            .finish()
    }
}

#[derive(Default)]
struct Handlers {
    named: HashMap<HandlerKind, HashMap<String, Handler>>,
    wildcard: HashMap<HandlerKind, Handler>,
}

/// Subscription a remote sender holds on us
struct ActiveSubscription {
    name: String,
    options: Value,
    sender_id: Option<String>,
}

/// Handler registry plus the remote subscriptions it is serving
#[derive(Default)]
pub(crate) struct Router {
    handlers: Mutex<Handlers>,
    active: DashMap<String, ActiveSubscription>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `handler`; `*` fills the wildcard slot of `kind`
    pub(crate) fn register(&self, kind: HandlerKind, name: &str, handler: Handler) {
        let mut handlers = self.handlers.lock();
        if name == WILDCARD {
            handlers.wildcard.insert(kind, handler);
        } else {
            handlers
                .named
                .entry(kind)
                .or_default()
                .insert(name.to_string(), handler);
        }
    }

    /// Remove the handlers registered under exactly `name`; `*` clears only
    /// the wildcard slots
    pub(crate) fn remove_named(&self, name: &str, kind: Option<RemovalKind>) -> usize {
        let kinds = kind.map(RemovalKind::kinds).unwrap_or(&ALL_KINDS);
        let mut handlers = self.handlers.lock();

        kinds
            .iter()
            .filter(|kind| {
                if name == WILDCARD {
                    handlers.wildcard.remove(*kind).is_some()
                } else {
                    handlers
                        .named
                        .get_mut(*kind)
                        .map_or(false, |named| named.remove(name).is_some())
                }
            })
            .count()
    }

    /// Remove handlers whose name matches `pattern`; `*` also clears wildcard slots
    pub(crate) fn remove(&self, pattern: &NamePattern, kind: Option<RemovalKind>) -> usize {
        let kinds = kind.map(RemovalKind::kinds).unwrap_or(&ALL_KINDS);
        let mut handlers = self.handlers.lock();
        let mut removed = 0;

        for kind in kinds {
            if let Some(named) = handlers.named.get_mut(kind) {
                let before = named.len();
                named.retain(|name, _| !pattern.matches(name));
                removed += before - named.len();
            }
            if pattern.is_any() && handlers.wildcard.remove(kind).is_some() {
                removed += 1;
            }
        }

        removed
    }

    pub(crate) fn remove_all(&self, pattern: Option<&NamePattern>) -> usize {
        match pattern {
            Some(pattern) => self.remove(pattern, None),
            None => self.remove(&NamePattern::any(), None),
        }
    }

    pub(crate) fn handler_count(&self) -> usize {
        let handlers = self.handlers.lock();
        handlers.named.values().map(HashMap::len).sum::<usize>() + handlers.wildcard.len()
    }

    pub(crate) fn active_subscriptions(&self) -> usize {
        self.active.len()
    }

    fn lookup(&self, kind: HandlerKind, name: &str) -> Option<Handler> {
        let handlers = self.handlers.lock();
        handlers
            .named
            .get(&kind)
            .and_then(|named| named.get(name))
            .or_else(|| handlers.wildcard.get(&kind))
            .cloned()
    }

    /// Route one incoming envelope
    pub(crate) fn dispatch(&self, mut envelope: Envelope, outlet: &Outlet) {
        let wire_name = envelope.name.clone();
        let (kind, name, success) = match envelope.kind {
            EnvelopeType::Request => (HandlerKind::Request, wire_name.clone(), EnvelopeType::Response),
            EnvelopeType::Subscription => match SubscriptionAction::split(&wire_name) {
                Some((SubscriptionAction::Subscribe, bare)) => {
                    (HandlerKind::Subscribe, bare.to_string(), EnvelopeType::Event)
                }
                Some((SubscriptionAction::Unsubscribe, bare)) => {
                    (HandlerKind::Unsubscribe, bare.to_string(), EnvelopeType::Event)
                }
                None => {
                    debug!(id = %envelope.id, name = %wire_name, "Subscription without action suffix");
                    let responder = Responder {
                        outlet: outlet.clone(),
                        id: envelope.id,
                        sender_id: envelope.sender_id,
                        name: wire_name.clone(),
                        success: EnvelopeType::Event,
                    };
                    if let Err(e) = responder.fail(ErrorBody::not_found(&wire_name)) {
                        debug!(error = %e, "Could not report missing handler");
                    }
                    return;
                }
            },
            // Replies are for senders
            EnvelopeType::Response | EnvelopeType::Event | EnvelopeType::Error => return,
        };

        let responder = Responder {
            outlet: outlet.clone(),
            id: envelope.id.clone(),
            sender_id: envelope.sender_id.clone(),
            name: name.clone(),
            success,
        };

        if kind == HandlerKind::Unsubscribe {
            self.active.remove(&envelope.id);
        }

        let handler = match self.lookup(kind, &name) {
            Some(handler) => handler,
            None => {
                debug!(id = %envelope.id, name = %wire_name, "No handler");
                if let Err(e) = responder.fail(ErrorBody::not_found(&wire_name)) {
                    debug!(error = %e, "Could not report missing handler");
                }
                return;
            }
        };

        debug!(id = %envelope.id, name = %wire_name, kind = ?kind, "Dispatching");
        envelope.name = name.clone();
        let id = envelope.id.clone();
        let sender_id = envelope.sender_id.clone();
        let options = envelope.body.clone();

        if invoke(&handler, envelope, responder) && kind == HandlerKind::Subscribe {
            self.active.insert(
                id,
                ActiveSubscription {
                    name,
                    options,
                    sender_id,
                },
            );
        }
    }

    /// Run the unsubscribe handler of every subscription still being served.
    /// Returns how many were released.
    pub(crate) fn release_subscriptions(&self, outlet: &Outlet) -> usize {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;

        for id in ids {
            let Some((id, subscription)) = self.active.remove(&id) else {
                continue;
            };
            released += 1;

            let Some(handler) = self.lookup(HandlerKind::Unsubscribe, &subscription.name) else {
                continue;
            };

            let mut envelope = Envelope::new(
                EnvelopeType::Subscription,
                id.clone(),
                subscription.name.clone(),
                subscription.options,
            );
            envelope.sender_id = subscription.sender_id.clone();

            let responder = Responder {
                outlet: outlet.clone(),
                id,
                sender_id: subscription.sender_id,
                name: subscription.name,
                success: EnvelopeType::Event,
            };
            invoke(&handler, envelope, responder);
        }

        released
    }
}

/// Call a handler, turning errors and panics into error replies.
/// Returns true when the handler succeeded.
fn invoke(handler: &Handler, envelope: Envelope, responder: Responder) -> bool {
    let name = envelope.name.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(envelope, responder.clone())));

    let error = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => {
            warn!(name = %name, error = %e, "Handler failed");
            ErrorBody::from_anyhow(&e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(name = %name, panic = %message, "Handler panicked");
            ErrorBody::new(message).with_name("Panic")
        }
    };

    if let Err(e) = responder.fail(error) {
        debug!(name = %name, error = %e, "Could not report handler failure");
    }
    false
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
