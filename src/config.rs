//! Configuration for tether endpoints

use std::time::Duration;

/// Tunables shared by [`Sender`](crate::Sender) and [`Receiver`](crate::Receiver)
#[derive(Debug, Clone)]
pub struct TetherConfig {
    /// How long a request waits for its response
    pub request_timeout: Duration,

    /// Flush delay of the outbound batch, re-armed on every append
    pub batch_delay: Duration,

    /// Batch size that forces an immediate flush
    pub max_batch_size: usize,

    /// Delay between starting teardown and releasing the channel
    pub disconnect_grace: Duration,

    /// Reject in-flight requests on disconnect instead of letting them time out
    pub reject_pending_on_disconnect: bool,
}

impl TetherConfig {
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            batch_delay: Duration::from_millis(1),
            max_batch_size: 10,
            disconnect_grace: Duration::from_secs(1),
            reject_pending_on_disconnect: false,
        }
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the batch flush delay
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Set the batch size threshold (at least 1)
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Set the teardown grace delay
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    /// Reject pending requests with `Shutdown` when disconnecting
    pub fn reject_pending_on_disconnect(mut self, reject: bool) -> Self {
        self.reject_pending_on_disconnect = reject;
        self
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self::new()
    }
}
