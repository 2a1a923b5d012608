//! Outbound message batching
//!
//! Envelopes are coalesced into `{"batch": [...]}` frames. Every append
//! re-arms a short flush timer; a full batch flushes right away. The batch is
//! drained under the lock and transmitted with no lock held, so a receiver
//! answering synchronously from inside the transmit cannot deadlock us.

use crate::envelope::{encode_batch, Envelope};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct BatchState {
    queue: Vec<Envelope>,
    /// Bumped on every re-arm or flush; a timer only fires for its own generation
    generation: u64,
    timer: Option<JoinHandle<()>>,
    transport: Option<Arc<Transport>>,
    runtime: Option<Handle>,
}

struct BatcherInner {
    delay: Duration,
    max_size: usize,
    state: Mutex<BatchState>,
    frames_sent: AtomicU64,
}

/// Coalesces outbound envelopes into batch frames
#[derive(Clone)]
pub(crate) struct Batcher {
    inner: Arc<BatcherInner>,
}

impl Batcher {
    pub(crate) fn new(delay: Duration, max_size: usize) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                delay,
                max_size: max_size.max(1),
                state: Mutex::new(BatchState::default()),
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Route flushed frames to `transport`; timers run on `runtime`
    pub(crate) fn attach(&self, transport: Arc<Transport>, runtime: Option<Handle>) {
        let mut state = self.inner.state.lock();
        state.transport = Some(transport);
        state.runtime = runtime;
    }

    /// Flush what is queued, then stop routing to the transport
    pub(crate) fn detach(&self) {
        self.flush();
        let mut state = self.inner.state.lock();
        state.transport = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Append an envelope to the current batch
    pub(crate) fn enqueue(&self, envelope: Envelope) {
        let (batch, transport) = {
            let mut state = self.inner.state.lock();
            state.queue.push(envelope);
            state.generation = state.generation.wrapping_add(1);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }

            if state.queue.len() >= self.inner.max_size {
                (std::mem::take(&mut state.queue), state.transport.clone())
            } else {
                self.arm_timer(&mut state);
                return;
            }
        };

        self.inner.transmit(batch, transport);
    }

    /// Transmit the current batch now
    pub(crate) fn flush(&self) {
        let (batch, transport) = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            (std::mem::take(&mut state.queue), state.transport.clone())
        };

        self.inner.transmit(batch, transport);
    }

    /// Envelopes waiting for the next flush
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Frames handed to the transport successfully
    pub(crate) fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    fn arm_timer(&self, state: &mut BatchState) {
        let runtime = match state.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                debug!(queued = state.queue.len(), "No runtime for flush timer, batch held");
                return;
            }
        };

        let generation = state.generation;
        let inner = self.inner.clone();
        let delay = self.inner.delay;
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_generation(generation);
        }));
    }
}

impl BatcherInner {
    fn flush_generation(&self, generation: u64) {
        let (batch, transport) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            (std::mem::take(&mut state.queue), state.transport.clone())
        };

        self.transmit(batch, transport);
    }

    fn transmit(&self, batch: Vec<Envelope>, transport: Option<Arc<Transport>>) {
        if batch.is_empty() {
            return;
        }

        let Some(transport) = transport else {
            warn!(dropped = batch.len(), "No transport attached, dropping batch");
            return;
        };

        let frame = match encode_batch(&batch) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, dropped = batch.len(), "Failed to encode batch");
                return;
            }
        };

        debug!(size = batch.len(), "Flushing batch");
        match transport.send(frame) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, dropped = batch.len(), "Failed to transmit batch");
            }
        }
    }
}

impl Drop for BatcherInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}
