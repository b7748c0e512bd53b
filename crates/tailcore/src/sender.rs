//! Sender queue and back-pressure gate: hands batches to a sink through a
//! bounded primary channel backed by an unbounded overflow buffer, and
//! exposes a saturation flag that readers consult before producing more
//! events for a saturated queue key.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::model::QueueKey;

/// Per-queue-key sender state: a bounded `async_channel` for the steady
/// state, plus an unbounded overflow `VecDeque` that absorbs bursts once the
/// bounded channel is full, so a producer is never forced to drop a unit of
/// outgoing work. Generic over the unit being sent (a single [`crate::model::Batch`]
/// or an already-assembled [`crate::model::GroupBatch`]) since both the
/// batcher and the group queue hand off through this same gate.
pub struct SenderQueue<T> {
    key: QueueKey,
    primary_tx: async_channel::Sender<T>,
    primary_rx: async_channel::Receiver<T>,
    overflow: Mutex<VecDeque<T>>,
    saturated: AtomicBool,
    overflow_high_watermark: usize,
}

impl<T> SenderQueue<T> {
    pub fn new(key: QueueKey, primary_capacity: usize, overflow_high_watermark: usize) -> Self {
        let (primary_tx, primary_rx) = async_channel::bounded(primary_capacity.max(1));
        Self {
            key,
            primary_tx,
            primary_rx,
            overflow: Mutex::new(VecDeque::new()),
            saturated: AtomicBool::new(false),
            overflow_high_watermark,
        }
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    /// Offers a batch to the primary channel; on back-pressure, stashes it
    /// in the overflow buffer instead of blocking the caller. Readers
    /// sharing this queue key see [`SenderQueue::is_saturated`] flip once
    /// the overflow buffer crosses its high watermark.
    pub fn offer(&self, item: T) {
        match self.primary_tx.try_send(item) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(item)) => {
                let mut overflow = self.overflow.lock().unwrap();
                overflow.push_back(item);
                if overflow.len() >= self.overflow_high_watermark {
                    self.saturated.store(true, Ordering::Release);
                }
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                // Sink is gone; the pipeline is shutting down this key.
            }
        }
    }

    /// Called by the sender task after successfully delivering a batch to
    /// the sink, to drain overflow back into the primary channel and
    /// possibly clear saturation.
    pub fn drain_overflow_into_primary(&self) {
        let mut overflow = self.overflow.lock().unwrap();
        while let Some(item) = overflow.pop_front() {
            match self.primary_tx.try_send(item) {
                Ok(()) => {}
                Err(async_channel::TrySendError::Full(item)) => {
                    overflow.push_front(item);
                    break;
                }
                Err(async_channel::TrySendError::Closed(_)) => break,
            }
        }
        if overflow.len() < self.overflow_high_watermark {
            self.saturated.store(false, Ordering::Release);
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }

    /// Receives the next batch for the sender task to forward to the sink,
    /// waiting if none is currently available.
    pub async fn recv(&self) -> Option<T> {
        self.primary_rx.recv().await.ok()
    }

    /// Non-blocking variant of [`SenderQueue::recv`], used by a cooperative
    /// driver loop that must not stall waiting for new batches.
    pub fn try_recv(&self) -> Option<T> {
        self.primary_rx.try_recv().ok()
    }

    pub fn close(&self) {
        self.primary_tx.close();
    }
}
