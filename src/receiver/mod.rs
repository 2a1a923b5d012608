//! Callee-side endpoint
//!
//! A [`Receiver`] owns the handler registry and answers the requests and
//! subscriptions a [`Sender`](crate::Sender) posts on the shared channel.

mod pattern;
mod router;

pub use pattern::{NamePattern, PatternError};
pub use router::{Handler, HandlerKind, RemovalKind, Responder, WILDCARD};

use crate::config::TetherConfig;
use crate::envelope::{decode_frame, new_id, Envelope, EnvelopeType, DISCONNECT_REQUEST};
use crate::error::Result;
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::transport::{Target, Transport};

use parking_lot::Mutex;
use router::{Outlet, Router};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Called once when the receiver tears down, whichever side started it
pub type DisconnectHook = Box<dyn FnOnce() + Send>;

struct ReceiverInner {
    id: Arc<str>,
    config: TetherConfig,
    lifecycle: Arc<Lifecycle>,
    router: Router,
    transport: Mutex<Option<Arc<Transport>>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

/// Callee-side tether endpoint
///
/// Handlers may be registered before or after connecting. Cheaply
/// cloneable; clones share the same registry and connection.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<ReceiverInner>,
}

impl Receiver {
    pub fn new(config: TetherConfig) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                id: Arc::from(new_id()),
                config,
                lifecycle: Arc::new(Lifecycle::new()),
                router: Router::new(),
                transport: Mutex::new(None),
                on_disconnect: Mutex::new(None),
            }),
        }
    }

    /// Endpoint id stamped as `receiverId` on every reply
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TetherConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lifecycle.subscribe()
    }

    /// Attach to a channel and start answering
    pub async fn connect(&self, target: impl Into<Target>) -> Result<()> {
        self.attach(target.into(), None).await
    }

    /// Attach to a channel; `on_disconnect` runs once on teardown
    pub async fn connect_with<F>(&self, target: impl Into<Target>, on_disconnect: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach(target.into(), Some(Box::new(on_disconnect))).await
    }

    async fn attach(&self, target: Target, on_disconnect: Option<DisconnectHook>) -> Result<()> {
        let transport = Arc::new(Transport::connect(target)?);
        self.inner.lifecycle.begin_connect()?;

        *self.inner.on_disconnect.lock() = on_disconnect;
        *self.inner.transport.lock() = Some(transport.clone());

        let weak = Arc::downgrade(&self.inner);
        transport.on_receive(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_frame(message);
            }
        }));

        info!(receiver = %self.inner.id, kind = ?transport.kind(), "Receiver connected");
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Answer requests named `name` (`*` for any unmatched request)
    pub fn on_request<F>(&self, name: &str, handler: F)
    where
        F: Fn(Envelope, Responder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .router
            .register(HandlerKind::Request, name, Arc::new(handler));
    }

    /// Serve subscriptions to `name`. The handler keeps the [`Responder`] to
    /// emit events.
    pub fn on_subscribe<F>(&self, name: &str, handler: F)
    where
        F: Fn(Envelope, Responder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .router
            .register(HandlerKind::Subscribe, name, Arc::new(handler));
    }

    /// Release resources held for a subscription to `name`
    pub fn on_unsubscribe<F>(&self, name: &str, handler: F)
    where
        F: Fn(Envelope, Responder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .router
            .register(HandlerKind::Unsubscribe, name, Arc::new(handler));
    }

    /// Remove the handler registered under `name`, optionally only of one
    /// kind. `*` removes just the wildcard handler. Returns how many were
    /// removed.
    pub fn remove_handler(&self, name: &str, kind: Option<RemovalKind>) -> usize {
        self.inner.router.remove_named(name, kind)
    }

    /// Remove every handler, or every handler matching `pattern`
    /// (`name`, `prefix.*` or `*`)
    pub fn remove_all_handlers(&self, pattern: Option<&str>) -> Result<usize> {
        let pattern = pattern.map(NamePattern::parse).transpose()?;
        Ok(self.inner.router.remove_all(pattern.as_ref()))
    }

    pub fn handler_count(&self) -> usize {
        self.inner.router.handler_count()
    }

    /// Subscriptions currently being served
    pub fn active_subscription_count(&self) -> usize {
        self.inner.router.active_subscriptions()
    }

    /// Tear down: release active subscriptions, stop answering, run the
    /// disconnect hook and close the channel after the grace delay
    pub fn disconnect(&self) -> Result<()> {
        self.inner.teardown();
        Ok(())
    }
}

impl ReceiverInner {
    fn handle_frame(&self, message: Value) {
        if self.lifecycle.state() != ConnectionState::Connected {
            return;
        }

        let envelopes = match decode_frame(&message) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        for envelope in envelopes {
            // A handler may have torn us down mid-batch
            if self.lifecycle.state() != ConnectionState::Connected {
                return;
            }

            if envelope.kind == EnvelopeType::Request && envelope.name == DISCONNECT_REQUEST {
                info!(receiver = %self.id, sender = ?envelope.sender_id, "Sender disconnected");
                self.teardown();
                return;
            }

            let Some(outlet) = self.outlet() else {
                return;
            };
            self.router.dispatch(envelope, &outlet);
        }
    }

    fn outlet(&self) -> Option<Outlet> {
        self.transport
            .lock()
            .clone()
            .map(|transport| Outlet::new(transport, self.id.clone()))
    }

    fn teardown(&self) {
        if !self.lifecycle.begin_disconnect() {
            debug!(receiver = %self.id, state = ?self.lifecycle.state(), "Disconnect ignored");
            return;
        }

        let transport = self.transport.lock().take();
        let mut released = 0;
        if let Some(transport) = &transport {
            released = self
                .router
                .release_subscriptions(&Outlet::new(transport.clone(), self.id.clone()));
            transport.stop_receiving();
        }

        let hook = self.on_disconnect.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        info!(receiver = %self.id, released, "Receiver disconnecting");
        self.lifecycle
            .release_after(self.config.disconnect_grace, move || {
                if let Some(transport) = transport {
                    transport.close();
                }
            });
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
