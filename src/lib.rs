//! Tether - request/response and subscription protocol over a message channel
//!
//! Two isolated contexts (a host and an embedded guest, two threads, two
//! tasks) exchange typed requests, responses and event subscriptions over one
//! channel that can only post opaque JSON messages. A [`Sender`] batches
//! outbound calls and matches replies to callers; a [`Receiver`] routes them
//! to registered handlers.
//!
//! # Example
//!
//! ```no_run
//! use tether::{MessageChannel, Receiver, Sender, TetherConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (host, guest) = MessageChannel::new();
//!
//!     let receiver = Receiver::new(TetherConfig::default());
//!     receiver.on_request("ping", |_, res| {
//!         res.send(json!("pong"))?;
//!         Ok(())
//!     });
//!     receiver.connect(guest).await?;
//!
//!     let sender = Sender::new(TetherConfig::default());
//!     sender.connect(host).await?;
//!
//!     let reply = sender.post_request("ping", json!("hi")).await?;
//!     assert_eq!(reply, json!("pong"));
//!
//!     // Long-lived subscription
//!     let sub = sender.subscribe("page.onUrlChange", |event| {
//!         println!("url changed: {}", event);
//!     })?;
//!     sub.unsubscribe();
//!
//!     sender.disconnect()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use config::TetherConfig;
pub use envelope::{Envelope, EnvelopeType, ErrorBody, SubscriptionAction};
pub use error::{ChannelError, Result, TetherError};
pub use lifecycle::ConnectionState;
pub use receiver::{HandlerKind, NamePattern, Receiver, RemovalKind, Responder};
pub use sender::{EventCallback, Sender, SubscriptionHandle};
pub use transport::{
    BroadcastChannel, BroadcastHub, EventTarget, MessageChannel, MessagePort, MessagePortLike,
    PostMessage, SharedTarget, Target, Transport, TransportKind,
};
