//! Caller-side endpoint
//!
//! A [`Sender`] posts requests and subscriptions to a [`Receiver`](crate::Receiver)
//! on the other side of a channel and matches the replies back to the caller.

mod batcher;
mod correlation;
mod subscriptions;

pub use subscriptions::EventCallback;

use crate::config::TetherConfig;
use crate::envelope::{
    decode_frame, encode_envelope, new_id, Envelope, EnvelopeType, ErrorBody, SubscriptionAction,
    DISCONNECT_REQUEST,
};
use crate::error::{Result, TetherError};
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::transport::{Target, Transport};

use batcher::Batcher;
use correlation::{CorrelationTable, PendingGuard};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use subscriptions::SubscriptionRegistry;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// An active subscription that can be torn down
pub struct SubscriptionHandle {
    id: String,
    name: String,
    sender: Weak<SenderInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event name this subscription listens to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop delivering events and tell the receiver to release the
    /// subscription. The local callback is gone once this returns; the remote
    /// notification goes out with the next batch.
    pub fn unsubscribe(self) {
        if let Some(sender) = self.sender.upgrade() {
            sender.unsubscribe(&self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct SenderInner {
    id: String,
    config: TetherConfig,
    lifecycle: Arc<Lifecycle>,
    transport: Mutex<Option<Arc<Transport>>>,
    batcher: Batcher,
    pending: CorrelationTable,
    subscriptions: SubscriptionRegistry,
}

/// Caller-side tether endpoint
///
/// Cheaply cloneable; clones share the same connection.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    pub fn new(config: TetherConfig) -> Self {
        let batcher = Batcher::new(config.batch_delay, config.max_batch_size);
        Self {
            inner: Arc::new(SenderInner {
                id: new_id(),
                config,
                lifecycle: Arc::new(Lifecycle::new()),
                transport: Mutex::new(None),
                batcher,
                pending: CorrelationTable::new(),
                subscriptions: SubscriptionRegistry::new(),
            }),
        }
    }

    /// Endpoint id stamped as `senderId` on every outbound envelope
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

    /// Calls waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Batch frames transmitted so far
    pub fn frames_sent(&self) -> u64 {
        self.inner.batcher.frames_sent()
    }

    /// Attach to a channel
    ///
    /// Fails with `TransportUnsupported` for targets that cannot receive,
    /// leaving the sender disconnected so another target can be tried.
    pub async fn connect(&self, target: impl Into<Target>) -> Result<()> {
        let transport = Arc::new(Transport::connect(target.into())?);
        self.inner.lifecycle.begin_connect()?;

        let weak = Arc::downgrade(&self.inner);
        transport.on_receive(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_frame(message);
            }
        }));

        self.inner
            .batcher
            .attach(transport.clone(), self.inner.lifecycle.runtime());
        *self.inner.transport.lock() = Some(transport.clone());

        info!(sender = %self.inner.id, kind = ?transport.kind(), "Sender connected");
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Send a request and wait for its reply, bounded by the configured timeout
    pub async fn post_request(&self, name: &str, body: Value) -> Result<Value> {
        self.post_request_with_timeout(name, body, self.inner.config.request_timeout)
            .await
    }

    /// Send a request with a per-call timeout
    pub async fn post_request_with_timeout(
        &self,
        name: &str,
        body: Value,
        wait: Duration,
    ) -> Result<Value> {
        self.inner.lifecycle.ensure_connected()?;

        let id = new_id();
        let rx = self.inner.pending.register(&id, name);
        let _guard = PendingGuard::new(&self.inner.pending, &id);

        debug!(id = %id, name = %name, "Posting request");
        self.inner
            .batcher
            .enqueue(Envelope::request(id.clone(), name, body).with_sender(self.inner.id.clone()));

        match timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TetherError::Shutdown),
            Err(_) => {
                self.inner.pending.discard(&id);
                debug!(id = %id, name = %name, "Request timed out");
                Err(TetherError::Timeout {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Typed request: serialize `payload`, deserialize the reply body
    pub async fn request<Req: Serialize, Res: DeserializeOwned>(
        &self,
        name: &str,
        payload: &Req,
    ) -> Result<Res> {
        let body = serde_json::to_value(payload)?;
        let reply = self.post_request(name, body).await?;
        serde_json::from_value(reply).map_err(TetherError::Serialization)
    }

    /// Subscribe to a named event stream
    pub fn subscribe<F>(&self, name: &str, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe_with(name, Value::Null, callback)
    }

    /// Subscribe with options forwarded to the receiver's subscribe handler
    pub fn subscribe_with<F>(
        &self,
        name: &str,
        options: Value,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.lifecycle.ensure_connected()?;

        let id = new_id();
        self.inner
            .subscriptions
            .insert(&id, name, options.clone(), Arc::new(callback));

        debug!(id = %id, name = %name, "Subscribing");
        self.inner.batcher.enqueue(
            Envelope::subscription(id.clone(), name, SubscriptionAction::Subscribe, options)
                .with_sender(self.inner.id.clone()),
        );

        Ok(SubscriptionHandle {
            id,
            name: name.to_string(),
            sender: Arc::downgrade(&self.inner),
        })
    }

    /// Tear down the connection
    ///
    /// Flushes queued envelopes, tells the receiver we are leaving, drops all
    /// subscriptions and releases the channel after the grace delay. Calls
    /// still waiting settle through their own timeouts unless
    /// `reject_pending_on_disconnect` is set.
    pub fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_disconnect() {
            debug!(sender = %inner.id, state = ?inner.lifecycle.state(), "Disconnect ignored");
            return Ok(());
        }

        inner.batcher.flush();

        let transport = inner.transport.lock().take();
        if let Some(transport) = &transport {
            let farewell =
                Envelope::request(inner.id.clone(), DISCONNECT_REQUEST, Value::Null).with_sender(inner.id.clone());
            match encode_envelope(&farewell) {
                Ok(frame) => {
                    if let Err(e) = transport.send(frame) {
                        debug!(error = %e, "Disconnect notice not delivered");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode disconnect notice"),
            }
            transport.stop_receiving();
        }

        let dropped = inner.subscriptions.clear();
        inner.batcher.detach();

        if inner.config.reject_pending_on_disconnect {
            let rejected = inner.pending.reject_all(|| TetherError::Shutdown);
            debug!(rejected, "Rejected pending calls");
        }

        info!(sender = %inner.id, subscriptions = dropped, "Sender disconnecting");
        inner
            .lifecycle
            .release_after(inner.config.disconnect_grace, move || {
                if let Some(transport) = transport {
                    transport.close();
                }
            });
        Ok(())
    }
}

impl SenderInner {
    fn handle_frame(&self, message: Value) {
        let envelopes = match decode_frame(&message) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        for envelope in envelopes {
            self.handle_envelope(envelope);
        }
    }

    fn handle_envelope(&self, envelope: Envelope) {
        if let Some(sender_id) = &envelope.sender_id {
            if *sender_id != self.id {
                return;
            }
        }

        match envelope.kind {
            EnvelopeType::Response => {
                if !self.pending.resolve(&envelope.id, envelope.body) {
                    debug!(id = %envelope.id, name = %envelope.name, "Response for unknown call");
                }
            }
            EnvelopeType::Error => {
                let error = ErrorBody::from_value(envelope.body);
                if !self.pending.reject(&envelope.id, error) {
                    debug!(id = %envelope.id, name = %envelope.name, "Error for unknown call");
                }
            }
            EnvelopeType::Event => {
                if !self.subscriptions.dispatch(&envelope.id, envelope.body) {
                    debug!(id = %envelope.id, name = %envelope.name, "Event for unknown subscription");
                }
            }
            // Our own traffic echoed back on shared targets
            EnvelopeType::Request | EnvelopeType::Subscription => {}
        }
    }

    fn unsubscribe(&self, id: &str) {
        let Some((name, options)) = self.subscriptions.remove(id) else {
            return;
        };

        debug!(id = %id, name = %name, "Unsubscribing");
        if self.lifecycle.state() == ConnectionState::Connected {
            self.batcher.enqueue(
                Envelope::subscription(id, &name, SubscriptionAction::Unsubscribe, options)
                    .with_sender(self.id.clone()),
            );
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
