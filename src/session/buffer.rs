//! Bounded pool of move-only byte buffers.
//!
//! Every frame that crosses the mailbox is a [`PoolBuf`]. Dropping it
//! returns its slot to the pool, so a buffer is released exactly once on
//! every path, including early rejection and failed enqueue.

use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Buffers available to producers and the decrypt path combined.
pub const POOL_CAPACITY: usize = 16;
/// Largest single buffer.
pub const BUFFER_MAX: usize = 1536;

struct PoolInner {
    capacity: usize,
    max_len: usize,
    in_use: AtomicUsize,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_len: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                max_len,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve a zeroed buffer of `len` bytes, or `None` when the pool is
    /// exhausted or `len` exceeds the buffer size.
    pub fn alloc(&self, len: usize) -> Option<PoolBuf> {
        if len > self.inner.max_len {
            return None;
        }
        self.inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.capacity).then_some(n + 1)
            })
            .ok()?;
        Some(PoolBuf {
            data: vec![0u8; len],
            pool: Arc::clone(&self.inner),
        })
    }

    /// Reserve a buffer holding a copy of `bytes`.
    pub fn alloc_copy(&self, bytes: &[u8]) -> Option<PoolBuf> {
        let mut buf = self.alloc(bytes.len())?;
        buf.copy_from_slice(bytes);
        Some(buf)
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn max_len(&self) -> usize {
        self.inner.max_len
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY, BUFFER_MAX)
    }
}

/// A pool slot. Not `Clone`; dropping it frees the slot.
pub struct PoolBuf {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PoolBuf {
    /// Shrink to the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolBuf({} bytes)", self.data.len())
    }
}
