//! Error types for tether endpoints

use crate::envelope::ErrorBody;
use crate::receiver::PatternError;
use thiserror::Error;

/// Failures reported by a channel implementation when posting a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel (or its peer) has been closed
    #[error("channel closed")]
    Closed,

    /// The port is no longer entangled with a peer
    #[error("channel detached from its peer")]
    Detached,

    /// Any other channel-specific failure
    #[error("{0}")]
    Other(String),
}

/// Errors that can occur when using a tether endpoint
#[derive(Error, Debug)]
pub enum TetherError {
    /// Connecting was refused (e.g. already connected)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Endpoint is not connected, or is tearing down
    #[error("Not connected")]
    NotConnected,

    /// No reply arrived within the configured window
    #[error("timeout on {name}")]
    Timeout { name: String },

    /// The remote side answered with an error envelope
    #[error("{0}")]
    Remote(ErrorBody),

    /// The target exposes no receive capability the adapter understands
    #[error("Transport unsupported: {0}")]
    TransportUnsupported(String),

    /// Posting on the underlying channel failed
    #[error("Transport error: {0}")]
    Transport(#[from] ChannelError),

    /// Failed to serialize/deserialize a body
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler name pattern could not be parsed
    #[error("Invalid handler pattern: {0}")]
    Pattern(#[from] PatternError),

    /// The endpoint shut down while the call was pending
    #[error("Endpoint shut down")]
    Shutdown,
}

impl TetherError {
    /// The remote error body, if the call was rejected by the other side
    pub fn remote(&self) -> Option<&ErrorBody> {
        match self {
            TetherError::Remote(body) => Some(body),
            _ => None,
        }
    }
}

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
