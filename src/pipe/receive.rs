use std::sync::atomic::{AtomicBool, Ordering};

use super::{Pipe, Segment};

/// Incoming queue of a client connection
///
/// Data messages are queued; connection edges are latched flags that fire at
/// most once per connection and are cleared when read.
pub struct ReceivePipe {
    pipe: Pipe,
    connected: AtomicBool,
    disconnected: AtomicBool,
}

impl ReceivePipe {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pipe: Pipe::new(max_message_size),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
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

    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Whether the disconnected latch is set, without resetting it
    pub fn disconnect_pending(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Read and reset the connected latch
    pub fn check_connected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Read and reset the disconnected latch
    pub fn check_disconnected(&self) -> bool {
        self.disconnected.swap(false, Ordering::AcqRel)
    }

    /// Drop queued messages and reset both latches
    pub fn clear(&self) {
        self.pipe.clear();
        self.connected.store(false, Ordering::Release);
        self.disconnected.store(false, Ordering::Release);
    }
}
