//! Connection lifecycle shared by both endpoint kinds

use crate::error::{Result, TetherError};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Connection state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not attached to a channel
    Disconnected,
    /// Attached and exchanging envelopes
    Connected,
    /// Teardown started, channel not yet released
    Disconnecting,
}

/// State machine plus the runtime the endpoint's timers run on
pub(crate) struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    runtime: Mutex<Option<Handle>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            state_rx,
            runtime: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Move `from` -> `to` atomically; false if the state was something else
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Claim the Disconnected -> Connected transition and capture the
    /// current runtime for later timers
    pub(crate) fn begin_connect(&self) -> Result<()> {
        let current = self.state();
        if !self.transition(ConnectionState::Disconnected, ConnectionState::Connected) {
            return Err(TetherError::Connection(format!(
                "Cannot connect in state: {:?}",
                current
            )));
        }
        *self.runtime.lock() = Handle::try_current().ok();
        Ok(())
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(TetherError::NotConnected),
        }
    }

    /// Claim the Connected -> Disconnecting transition. Only one caller wins.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.transition(ConnectionState::Connected, ConnectionState::Disconnecting)
    }

    pub(crate) fn finish_disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Runtime captured at connect, or the ambient one
    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    /// Run `release` after `grace`, then mark the endpoint disconnected.
    /// A zero grace (or no runtime) releases inline.
    pub(crate) fn release_after<F>(self: &std::sync::Arc<Self>, grace: Duration, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let finish = {
            let lifecycle = self.clone();
            move || {
                release();
                lifecycle.finish_disconnect();
            }
        };

        if grace.is_zero() {
            finish();
            return;
        }

        match self.runtime() {
            Some(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    finish();
                });
            }
            None => finish(),
        }
    }
}
