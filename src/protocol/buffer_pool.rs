//! Reusable byte buffers for multi-fragment transfers.
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s sized for one transfer.
//! Dropping a pooled buffer clears it and returns its allocation to the
//! pool, so every exit path of a transfer releases the buffer.
//!
//! # Usage
//!
//! ```ignore
//! let pool = BufferPool::new();
//! let mut buf = pool.checkout(512);
//! buf.extend_from_slice(&fragment);
//! // buf goes back to the pool here
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Maximum number of idle buffers kept by the pool.
pub const BUFFER_POOL_SIZE: usize = 16;

/// Buffers larger than this are dropped instead of pooled.
pub const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// A pool of reusable buffers. Cloning shares the pool.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a cleared buffer with at least `capacity` bytes reserved.
    pub fn checkout(&self, capacity: usize) -> PooledBuffer {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut buf = reused.unwrap_or_default();
        buf.reserve(capacity);
        PooledBuffer {
            buf,
            pool: self.idle.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<Mutex<Vec<BytesMut>>>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut idle) = self.pool.lock() {
            if idle.len() < BUFFER_POOL_SIZE {
                idle.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_reserves_capacity() {
        let pool = BufferPool::new();
        let buf = pool.checkout(300);
        assert!(buf.capacity() >= 300);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.checkout(64);
            buf.extend_from_slice(b"fragment");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.checkout(16);
        assert!(buf.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new();
        let buffers: Vec<_> = (0..BUFFER_POOL_SIZE + 4)
            .map(|_| pool.checkout(8))
            .collect();
        drop(buffers);
        assert_eq!(pool.idle(), BUFFER_POOL_SIZE);
    }

    #[test]
    fn test_oversized_buffers_not_retained() {
        let pool = BufferPool::new();
        drop(pool.checkout(MAX_RETAINED_CAPACITY * 2));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_clones_share_pool() {
        let pool = BufferPool::new();
        let other = pool.clone();
        drop(other.checkout(8));
        assert_eq!(pool.idle(), 1);
    }
}
