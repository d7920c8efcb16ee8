//! Push/pull bridge between event producers and a consuming session user.
//!
//! Producers (notification pumps, PTY reader threads, fire-and-forget RPC
//! tasks) call [`MessageQueue::push`]. The consumer pulls with
//! [`MessageQueue::recv`] from async code or [`MessageQueue::blocking_recv`]
//! from a plain thread. Closing the queue lets the consumer drain whatever was
//! already queued and then observe `None`.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Unbounded FIFO queue with an explicit close.
pub struct MessageQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Enqueue an item. Returns `false` (and drops the item) once closed.
    pub fn push(&self, item: T) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Close the queue. Idempotent; queued items remain readable.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    /// Wait for the next item. `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Take the next item if one is ready.
    ///
    /// Also returns `None` while another consumer is parked in `recv()`.
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Blocking variant of [`recv`](Self::recv) for synchronous consumers.
    ///
    /// Must not be called from inside an async runtime thread.
    pub fn blocking_recv(&self) -> Option<T> {
        self.receiver.blocking_lock().blocking_recv()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
