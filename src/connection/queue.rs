//! Outbound frame queue.
//!
//! Consumers push from any thread; the polling engine pops one entry per
//! writable notification. Closing the queue and draining it happen under
//! the same lock, so no entry can be popped (and written) once the queue
//! has been closed.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::Opcode;

// ============================================================================
// Types
// ============================================================================

/// Single-fire completion handle of one write.
pub type Completion = oneshot::Sender<Result<()>>;

// ============================================================================
// PendingWrite
// ============================================================================

/// One frame waiting for the socket to become writable.
#[derive(Debug)]
pub struct PendingWrite {
    /// Frame payload.
    pub data: Vec<u8>,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Final frame of its message.
    pub fin: bool,
    /// Resolved once the frame was written or failed.
    pub completion: Option<Completion>,
}

impl PendingWrite {
    /// Creates a queue entry.
    #[must_use]
    pub fn new(data: Vec<u8>, opcode: Opcode, fin: bool, completion: Option<Completion>) -> Self {
        Self {
            data,
            opcode,
            fin,
            completion,
        }
    }

    /// Resolves the completion handle, if any.
    pub fn resolve(self, result: Result<()>) {
        if let Some(completion) = self.completion {
            // The caller may have stopped waiting.
            let _ = completion.send(result);
        }
    }

    /// Fails the completion handle with `error`.
    #[inline]
    pub fn fail(self, error: Error) {
        self.resolve(Err(error));
    }
}

// ============================================================================
// WriteQueue
// ============================================================================

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<PendingWrite>,
    closed: bool,
}

/// Thread-safe FIFO of pending outbound frames.
#[derive(Debug, Default)]
pub struct WriteQueue {
    state: Mutex<QueueState>,
}

impl WriteQueue {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entries` as one contiguous run.
    ///
    /// # Errors
    ///
    /// Returns the entries untouched if the queue is already closed.
    pub fn push_all(&self, entries: Vec<PendingWrite>) -> std::result::Result<(), Vec<PendingWrite>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(entries);
        }
        state.entries.extend(entries);
        Ok(())
    }

    /// Removes the oldest entry. Always `None` after [`close`](Self::close).
    pub fn pop(&self) -> Option<PendingWrite> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.entries.pop_front()
    }

    /// Closes the queue and returns everything still pending, oldest first.
    ///
    /// Returns an empty list if the queue was already closed.
    pub fn close(&self) -> Vec<PendingWrite> {
        let mut state = self.state.lock();
        state.closed = true;
        state.entries.drain(..).collect()
    }

    /// Returns the number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns `true` once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> PendingWrite {
        PendingWrite::new(vec![byte], Opcode::Binary, true, None)
    }

    #[test]
    fn test_fifo_order() {
        let queue = WriteQueue::new();
        queue.push_all(vec![entry(1), entry(2)]).expect("push");
        queue.push_all(vec![entry(3)]).expect("push");

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop()).map(|e| e.data[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let queue = WriteQueue::new();
        queue.push_all(vec![entry(1), entry(2)]).expect("push");

        let drained = queue.close();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_closed());
        assert!(queue.pop().is_none());

        let rejected = queue.push_all(vec![entry(3)]).expect_err("closed queue");
        assert_eq!(rejected.len(), 1);
        assert!(queue.close().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_completion() {
        let (tx, rx) = oneshot::channel();
        PendingWrite::new(b"x".to_vec(), Opcode::Text, true, Some(tx)).resolve(Ok(()));
        assert!(rx.await.expect("completion").is_ok());

        let (tx, rx) = oneshot::channel();
        PendingWrite::new(b"x".to_vec(), Opcode::Text, true, Some(tx)).fail(Error::ConnectionClosed);
        assert!(matches!(rx.await.expect("completion"), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_resolve_without_receiver_is_harmless() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        PendingWrite::new(Vec::new(), Opcode::Ping, true, Some(tx)).resolve(Ok(()));
    }
}
