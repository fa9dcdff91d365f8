//! Reusable scratch buffers for the encode path.
//!
//! Every encoded message needs a scratch buffer before the final owned copy
//! is produced. Rather than allocating one per message, the codec draws
//! buffers from a [`BufferPool`] and reinserts them afterwards. Retention is
//! bounded both ways: the free list is capped, and buffers that grew past
//! [`BufferPool::MAX_RETAINED_CAPACITY`] are dropped instead of reinserted.
//!
//! Message records themselves are plainly allocated; ownership moves them
//! through the pipeline without aliasing, so only the byte buffers are worth
//! recycling.

use std::sync::{Mutex, OnceLock};

/// A bounded free list of `Vec<u8>` scratch buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    /// Initial capacity of a freshly allocated buffer, sized for typical
    /// RPC messages.
    pub const INITIAL_CAPACITY: usize = 4 * 1024;

    /// Buffers that grew beyond this are not reinserted.
    pub const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

    /// Default bound on the free list length.
    pub const DEFAULT_MAX_BUFFERS: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_BUFFERS)
    }

    /// Create a pool retaining at most `max_buffers` idle buffers.
    pub fn with_capacity(max_buffers: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_buffers,
        }
    }

    /// Take a cleared buffer from the pool, allocating if the free list is
    /// empty.
    pub fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(Self::INITIAL_CAPACITY),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Oversized buffers and buffers beyond the retention bound are dropped
    /// so the pool cannot accumulate unbounded memory.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() > Self::MAX_RETAINED_CAPACITY {
            return;
        }
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide pool backing [`crate::codec::JsonCodec::new`].
pub fn default_pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}
