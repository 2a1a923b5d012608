//! Wire model for the tether protocol
//!
//! Every logical message is an [`Envelope`]. Senders coalesce envelopes into a
//! batch frame `{"batch": [...]}`; receivers answer with bare envelopes. Both
//! shapes are accepted by [`decode_frame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Wire-level suffix of a subscription registration
pub const SUBSCRIBE_SUFFIX: &str = ":subscribe";

/// Wire-level suffix of a subscription teardown
pub const UNSUBSCRIBE_SUFFIX: &str = ":unsubscribe";

/// Request a sender posts when it goes away
pub const DISCONNECT_REQUEST: &str = "connection.disconnect";

/// Generate a fresh envelope or endpoint id
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Kind of envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Subscription,
    Response,
    Event,
    Error,
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvelopeType::Request => "request",
            EnvelopeType::Subscription => "subscription",
            EnvelopeType::Response => "response",
            EnvelopeType::Event => "event",
            EnvelopeType::Error => "error",
        };
        f.write_str(s)
    }
}

/// One logical protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlation id, unique per outstanding call or subscription
    pub id: String,

    /// Id of the calling endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,

    /// Id of the answering endpoint (replies only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,

    #[serde(rename = "type")]
    pub kind: EnvelopeType,

    /// Handler name, or the mirrored name on replies
    pub name: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, id: impl Into<String>, name: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            sender_id: None,
            receiver_id: None,
            kind,
            name: name.into(),
            body,
        }
    }

    pub fn request(id: impl Into<String>, name: impl Into<String>, body: Value) -> Self {
        Self::new(EnvelopeType::Request, id, name, body)
    }

    /// Subscription control envelope; `name` is the bare event name
    pub fn subscription(
        id: impl Into<String>,
        name: &str,
        action: SubscriptionAction,
        options: Value,
    ) -> Self {
        Self::new(EnvelopeType::Subscription, id, action.wire_name(name), options)
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    /// Split a subscription envelope's wire name into action and bare name
    pub fn subscription_action(&self) -> Option<(SubscriptionAction, &str)> {
        if self.kind != EnvelopeType::Subscription {
            return None;
        }
        SubscriptionAction::split(&self.name)
    }
}

/// Whether a subscription envelope registers or tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    fn suffix(self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => SUBSCRIBE_SUFFIX,
            SubscriptionAction::Unsubscribe => UNSUBSCRIBE_SUFFIX,
        }
    }

    /// `foo` -> `foo:subscribe` / `foo:unsubscribe`
    pub fn wire_name(self, name: &str) -> String {
        format!("{}{}", name, self.suffix())
    }

    /// `foo:subscribe` -> (Subscribe, `foo`)
    pub fn split(wire_name: &str) -> Option<(SubscriptionAction, &str)> {
        if let Some(name) = wire_name.strip_suffix(UNSUBSCRIBE_SUFFIX) {
            return Some((SubscriptionAction::Unsubscribe, name));
        }
        wire_name
            .strip_suffix(SUBSCRIBE_SUFFIX)
            .map(|name| (SubscriptionAction::Subscribe, name))
    }
}

fn default_error_name() -> String {
    "Error".to_string()
}

/// Body of an `error` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default = "default_error_name")]
    pub name: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: default_error_name(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Error reported when no handler matches a request
    pub fn not_found(wire_name: &str) -> Self {
        Self::new(format!("Request \"{}\" not found", wire_name)).with_name("HandlerNotFound")
    }

    /// Capture a handler failure. An `ErrorBody` carried by the error is kept as is.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(body) = err.downcast_ref::<ErrorBody>() {
            return body.clone();
        }
        let mut body = Self::new(err.to_string());
        if let Some(cause) = err.chain().nth(1) {
            body.cause = Some(Value::String(cause.to_string()));
        }
        body
    }

    /// Lenient decode of whatever the remote put in the error body
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new(message),
            Value::Object(_) => match serde_json::from_value::<ErrorBody>(value.clone()) {
                Ok(body) => body,
                Err(_) => Self::new(value.to_string()),
            },
            Value::Null => Self::new("unknown error"),
            other => Self::new(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorBody {}

/// A physical transmission: a batch frame or a single envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Batch { batch: Vec<Envelope> },
    Single(Envelope),
}

impl Frame {
    pub fn into_envelopes(self) -> Vec<Envelope> {
        match self {
            Frame::Batch { batch } => batch,
            Frame::Single(envelope) => vec![envelope],
        }
    }
}

/// Encode envelopes as one batch frame
pub fn encode_batch(envelopes: &[Envelope]) -> Result<Value, serde_json::Error> {
    #[derive(Serialize)]
    struct BatchRef<'a> {
        batch: &'a [Envelope],
    }
    serde_json::to_value(BatchRef { batch: envelopes })
}

/// Encode a single envelope frame
pub fn encode_envelope(envelope: &Envelope) -> Result<Value, serde_json::Error> {
    serde_json::to_value(envelope)
}

/// Decode a received frame into its envelopes, in wire order
pub fn decode_frame(message: &Value) -> Result<Vec<Envelope>, serde_json::Error> {
    Frame::deserialize(message).map(Frame::into_envelopes)
}
