//! Bounded payload queue, one per output connection
//!
//! Concurrent producers (the read paths of every input feeding this output)
//! and a single consumer (the output's transmit task). All operations take
//! one mutex; the critical section is a pointer copy and an index bump.
//! Dropping on overflow is an expected operation, not an error: slow outputs
//! shed load locally instead of back-pressuring fast ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::payload::Payload;

/// Bounded FIFO of payloads with drop-on-overflow semantics
pub struct PayloadBuffer {
    queue: Mutex<VecDeque<Payload>>,
    capacity: usize,
    nonempty: Notify,
    overflow_latched: AtomicBool,
}

impl PayloadBuffer {
    /// Create a buffer holding at most `capacity` payloads
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            nonempty: Notify::new(),
            overflow_latched: AtomicBool::new(false),
        }
    }

    /// Push a payload at the tail.
    ///
    /// Returns `false` and discards the payload when the buffer is full.
    pub fn enqueue(&self, payload: Payload) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(payload);
        }
        self.nonempty.notify_one();
        true
    }

    /// The head payload, if any
    pub fn front(&self) -> Option<Payload> {
        self.queue.lock().front().cloned()
    }

    /// Remove the head payload; no-op when empty
    pub fn pop_front(&self) {
        self.queue.lock().pop_front();
    }

    /// Drop all held payloads
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolve once a payload has been enqueued.
    ///
    /// A permit is stored when an enqueue happens with no waiter, so the
    /// consumer never misses a wake between its emptiness check and the
    /// await. At most one consumer task waits at a time.
    pub(crate) async fn enqueued(&self) {
        self.nonempty.notified().await;
    }

    /// Whether the overflow warning latch is set
    pub(crate) fn latched(&self) -> bool {
        self.overflow_latched.load(Ordering::Acquire)
    }

    /// Set the latch; `true` for exactly one caller per full episode
    pub(crate) fn try_latch(&self) -> bool {
        self.overflow_latched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_latch(&self) {
        self.overflow_latched.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn payload(sequence: u64) -> Payload {
        Payload::new(1, sequence, Bytes::from_static(b"x"))
    }

    #[test]
    fn test_fifo_order() {
        let buffer = PayloadBuffer::new(4);

        assert!(buffer.enqueue(payload(1)));
        assert!(buffer.enqueue(payload(2)));

        assert_eq!(buffer.front().unwrap().sequence, 1);
        buffer.pop_front();
        assert_eq!(buffer.front().unwrap().sequence, 2);
        buffer.pop_front();
        assert!(buffer.front().is_none());
    }

    #[test]
    fn test_overflow_drops_exactly_excess() {
        let capacity = 4;
        let extra = 3;
        let buffer = PayloadBuffer::new(capacity);

        let mut dropped = 0;
        for sequence in 0..(capacity + extra) as u64 {
            if !buffer.enqueue(payload(sequence)) {
                dropped += 1;
            }
        }

        assert_eq!(buffer.len(), capacity);
        assert_eq!(dropped, extra);
        assert!(buffer.is_full());

        // Retained payloads are the first `capacity` in order
        for expected in 0..capacity as u64 {
            assert_eq!(buffer.front().unwrap().sequence, expected);
            buffer.pop_front();
        }
    }

    #[test]
    fn test_clear() {
        let buffer = PayloadBuffer::new(2);
        buffer.enqueue(payload(1));
        buffer.enqueue(payload(2));

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_latch_is_one_shot() {
        let buffer = PayloadBuffer::new(2);

        assert!(buffer.try_latch());
        assert!(!buffer.try_latch());
        assert!(buffer.latched());

        buffer.clear_latch();
        assert!(!buffer.latched());
        assert!(buffer.try_latch());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        use std::sync::Arc;

        let buffer = Arc::new(PayloadBuffer::new(2));

        // Permit stored by an enqueue with no waiter
        buffer.enqueue(payload(1));
        buffer.enqueued().await;

        // Waiter woken by a later enqueue
        let waiter = Arc::clone(&buffer);
        let task = tokio::spawn(async move { waiter.enqueued().await });
        tokio::task::yield_now().await;
        buffer.enqueue(payload(2));
        task.await.unwrap();
    }
}
