//! # Pipes
//!
//! Thread-safe message queues connecting a producer to a consumer, each paired
//! with its own [`BufferPool`].
//!
//! A pipe copies every enqueued message into a pooled buffer. The consumer
//! looks at the oldest message with [`Pipe::try_peek`], processes it without
//! holding the pipe's lock, and then acknowledges it with
//! [`Pipe::try_dequeue`], which hands the buffer back to the pool.
//!
//! ## Variants
//! - [`SendPipe`]: drains the whole queue into one batched write buffer
//! - [`ReceivePipe`]: adds one-shot connected/disconnected latches
//! - [`Inbox`]: the server's receive queue shared by all connections
//!
//! Every operation takes the lock for exactly one queue/pool mutation and
//! never blocks on I/O.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::utils::buffer_pool::BufferPool;

pub mod inbox;
pub mod receive;
pub mod send;

pub use inbox::Inbox;
pub use receive::ReceivePipe;
pub use send::SendPipe;

/// Read-only view of a queued message
///
/// Cloning is cheap. The underlying buffer only goes back to the pool once
/// every clone has been dropped and the message was dequeued.
#[derive(Debug, Clone)]
pub struct Segment(Arc<Vec<u8>>);

impl Segment {
    /// Whether both segments point at the same pooled buffer
    pub fn ptr_eq(a: &Segment, b: &Segment) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Address of the pooled buffer, stable across reuse
    pub fn buffer_id(&self) -> *const Vec<u8> {
        Arc::as_ptr(&self.0)
    }

    pub(crate) fn into_inner(self) -> Arc<Vec<u8>> {
        self.0
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Copy `bytes` into a buffer taken from `pool`
pub(crate) fn fill_segment(pool: &mut BufferPool, bytes: &[u8]) -> Segment {
    let mut buffer = pool.take();
    match Arc::get_mut(&mut buffer) {
        Some(inner) => inner.extend_from_slice(bytes),
        // take() only hands out unique buffers
        None => buffer = Arc::new(bytes.to_vec()),
    }
    Segment(buffer)
}

pub(crate) struct PipeState {
    pub(crate) queue: VecDeque<Segment>,
    pub(crate) pool: BufferPool,
}

/// Generic queue of opaque messages with a buffer pool
pub struct Pipe {
    state: Mutex<PipeState>,
}

impl Pipe {
    /// Create a pipe whose pooled buffers hold `max_message_size` bytes
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                pool: BufferPool::new(max_message_size),
            }),
        }
    }

    // A panicking consumer callback must not wedge the connection threads
    pub(crate) fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of queued messages
    pub fn count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Number of retired buffers waiting for reuse
    pub fn pool_count(&self) -> usize {
        self.lock().pool.available()
    }

    /// Copy `bytes` into a pooled buffer and append it
    pub fn enqueue(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let segment = fill_segment(&mut state.pool, bytes);
        state.queue.push_back(segment);
    }

    /// Oldest message, left in the queue
    pub fn try_peek(&self) -> Option<Segment> {
        self.lock().queue.front().cloned()
    }

    /// Remove the oldest message and retire its buffer
    ///
    /// Call this after the result of [`Pipe::try_peek`] has been dropped,
    /// otherwise the buffer is still shared and is released instead of pooled.
    pub fn try_dequeue(&self) -> bool {
        let mut state = self.lock();
        match state.queue.pop_front() {
            Some(segment) => {
                state.pool.retire(segment.into_inner());
                true
            }
            None => false,
        }
    }

    /// Dequeue everything, keeping the pool
    pub fn clear(&self) {
        let mut state = self.lock();
        while let Some(segment) = state.queue.pop_front() {
            state.pool.retire(segment.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let pipe = Pipe::new(16);
        pipe.enqueue(b"a");
        pipe.enqueue(b"b");
        assert_eq!(pipe.count(), 2);

        assert_eq!(&*pipe.try_peek().unwrap(), b"a");
        assert!(pipe.try_dequeue());
        assert_eq!(&*pipe.try_peek().unwrap(), b"b");
        assert!(pipe.try_dequeue());
        assert!(!pipe.try_dequeue());
        assert!(pipe.try_peek().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let pipe = Pipe::new(16);
        pipe.enqueue(b"x");
        let first = pipe.try_peek().unwrap();
        let second = pipe.try_peek().unwrap();
        assert!(Segment::ptr_eq(&first, &second));
        assert_eq!(pipe.count(), 1);
    }

    #[test]
    fn test_dequeue_recycles_exact_buffer() {
        let pipe = Pipe::new(16);
        pipe.enqueue(b"first");
        let id = pipe.try_peek().unwrap().buffer_id();
        assert!(pipe.try_dequeue());
        assert_eq!(pipe.pool_count(), 1);

        pipe.enqueue(b"second");
        let reused = pipe.try_peek().unwrap();
        assert_eq!(reused.buffer_id(), id);
        assert_eq!(&*reused, b"second");
        assert_eq!(pipe.pool_count(), 0);
    }

    #[test]
    fn test_held_segment_stays_valid_after_dequeue() {
        let pipe = Pipe::new(16);
        pipe.enqueue(b"keep");
        let held = pipe.try_peek().unwrap();
        assert!(pipe.try_dequeue());

        pipe.enqueue(b"next");
        assert_eq!(&*held, b"keep");
        assert_eq!(pipe.pool_count(), 0);
    }

    #[test]
    fn test_clear_retires_all() {
        let pipe = Pipe::new(16);
        for i in 0..5u8 {
            pipe.enqueue(&[i]);
        }
        pipe.clear();
        assert_eq!(pipe.count(), 0);
        assert_eq!(pipe.pool_count(), 5);
    }
}
