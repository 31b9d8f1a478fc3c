//! # Buffer Pool
//!
//! Recycles fixed-capacity message buffers so the hot send/receive paths do
//! not allocate once per message.
//!
//! The pool itself is not synchronized: each pipe owns one pool and guards it
//! with the same lock as its queue, so a buffer is never shared between the
//! send and the receive path.
//!
//! ## Usage
//! ```rust
//! use msgpipe::utils::buffer_pool::BufferPool;
//! use std::sync::Arc;
//!
//! let mut pool = BufferPool::new(1024);
//! let buffer = pool.take();
//! let id = Arc::as_ptr(&buffer);
//! assert!(pool.retire(buffer));
//! assert_eq!(Arc::as_ptr(&pool.take()), id);
//! ```

use std::sync::Arc;

/// Pool of reusable message buffers
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Arc<Vec<u8>>>,
    buffer_capacity: usize,
    allocated: usize,
}

impl BufferPool {
    /// Create an empty pool whose buffers hold up to `buffer_capacity` bytes
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            buffer_capacity,
            allocated: 0,
        }
    }

    /// Take a cleared buffer, reusing a retired one when possible
    ///
    /// The returned `Arc` is always unique, so `Arc::get_mut` succeeds on it.
    pub fn take(&mut self) -> Arc<Vec<u8>> {
        match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocated += 1;
                Arc::new(Vec::with_capacity(self.buffer_capacity))
            }
        }
    }

    /// Return a buffer to the pool
    ///
    /// Buffers that are still shared or were allocated with a smaller
    /// capacity are dropped instead. Returns whether the buffer was kept.
    pub fn retire(&mut self, mut buffer: Arc<Vec<u8>>) -> bool {
        match Arc::get_mut(&mut buffer) {
            Some(inner) if inner.capacity() >= self.buffer_capacity => {
                inner.clear();
                self.free.push(buffer);
                true
            }
            _ => false,
        }
    }

    /// Number of retired buffers ready for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers this pool ever had to allocate
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Capacity of every pooled buffer
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}
