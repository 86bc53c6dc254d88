//! Scratch-buffer recycling for the connection drain loop
//!
//! Draining a readable socket performs a burst of `recv` calls, each of
//! which needs a scratch buffer. [`BufferPool`] keeps a small free list of
//! previously used `Vec<u8>` so steady-state draining allocates nothing.

use std::sync::{Arc, Mutex};

/// A thread-safe free list of reusable byte buffers.
///
/// `acquire` never blocks and never fails: when the list is empty a fresh
/// buffer of the configured capacity is allocated. `release` clears the
/// buffer but keeps its capacity; buffers beyond the pool cap are dropped
/// so the pool cannot grow without bound.
#[derive(Clone, Debug)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Capacity given to newly allocated buffers.
    chunk_size: usize,
    /// Upper bound on retained buffers.
    max_retained: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `chunk_size` bytes, retaining
    /// at most `max_retained` of them between uses.
    pub fn new(chunk_size: usize, max_retained: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(max_retained))),
            chunk_size,
            max_retained,
        }
    }

    /// Take a buffer from the pool, allocating if none is available. The
    /// returned buffer is empty; contents from previous uses are cleared
    /// on release.
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.chunk_size))
    }

    /// Return a buffer for reuse. Cleared but capacity-preserving;
    /// silently dropped when the pool is full.
    pub fn release(&self, mut buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_retained {
            buf.clear();
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Capacity of freshly allocated buffers.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for BufferPool {
    /// 64 KiB scratch buffers, at most 8 retained — enough for one busy
    /// drain loop without pinning memory.
    fn default() -> Self {
        Self::new(64 * 1024, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_recycles() {
        let pool = BufferPool::new(512, 2);
        let mut a = pool.acquire();
        assert_eq!(a.capacity(), 512);
        a.extend_from_slice(b"junk");
        pool.release(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire();
        assert!(b.is_empty()); // cleared on release
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = BufferPool::new(64, 2);
        pool.release(Vec::with_capacity(64));
        pool.release(Vec::with_capacity(64));
        pool.release(Vec::with_capacity(64));
        assert_eq!(pool.idle(), 2);
    }
}
