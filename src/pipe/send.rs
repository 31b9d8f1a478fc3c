use bytes::BytesMut;

use super::{Pipe, Segment};
use crate::core::codec::{frame_len, write_frame};

/// Outgoing queue of one connection
///
/// The send loop empties it with [`SendPipe::dequeue_and_serialize_all`], so
/// any number of queued messages costs a single socket write.
pub struct SendPipe {
    pipe: Pipe,
}

impl SendPipe {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pipe: Pipe::new(max_message_size),
        }
    }

    pub fn enqueue(&self, bytes: &[u8]) {
        self.pipe.enqueue(bytes);
    }

    pub fn count(&self) -> usize {
        self.pipe.count()
    }

    pub fn pool_count(&self) -> usize {
        self.pipe.pool_count()
    }

    pub fn try_peek(&self) -> Option<Segment> {
        self.pipe.try_peek()
    }

    pub fn try_dequeue(&self) -> bool {
        self.pipe.try_dequeue()
    }

    pub fn clear(&self) {
        self.pipe.clear();
    }

    /// Frame every queued message into `out` and drain the queue
    ///
    /// `out` is overwritten and grown as needed. Returns the number of bytes
    /// written, or `None` when there was nothing to send.
    pub fn dequeue_and_serialize_all(&self, out: &mut BytesMut) -> Option<usize> {
        let mut state = self.pipe.lock();
        if state.queue.is_empty() {
            return None;
        }

        let total: usize = state.queue.iter().map(|s| frame_len(s.len())).sum();
        out.clear();
        out.reserve(total);

        let state = &mut *state;
        while let Some(segment) = state.queue.pop_front() {
            write_frame(&segment, out);
            state.pool.retire(segment.into_inner());
        }

        Some(total)
    }
}
