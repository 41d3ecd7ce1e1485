//! Pooled byte buffers for response bodies.
//!
//! Script and module fetches accumulate into buffers drawn from a small
//! shared pool so repeated fetches on a busy page do not re-allocate.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Buffers retained by a pool once released.
pub const DEFAULT_POOL_BUFFERS: usize = 8;

/// A bounded pool of reusable byte buffers. Cloning the pool clones a
/// handle to the same storage; the pool is single-threaded by design.
#[derive(Clone)]
pub struct BufferPool {
    free: Rc<RefCell<Vec<Vec<u8>>>>,
    max: usize,
}

impl BufferPool {
    #[inline]
    pub fn new(max: usize) -> Self {
        Self {
            free: Rc::new(RefCell::new(Vec::new())),
            max,
        }
    }

    /// Take a cleared buffer from the pool, or allocate a fresh one.
    #[inline]
    pub fn acquire(&self) -> PooledBuf {
        let buf = self.free.borrow_mut().pop().unwrap_or_default();
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently parked in the pool.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        let mut free = self.free.borrow_mut();
        if free.len() < self.max {
            buf.clear();
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    #[inline]
    fn default() -> Self {
        Self::new(DEFAULT_POOL_BUFFERS)
    }
}

/// A buffer checked out of a [`BufferPool`]; returns to the pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl PooledBuf {
    /// Body bytes decoded as lossy UTF-8.
    #[inline]
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(2);
        {
            let mut a = pool.acquire();
            a.extend_from_slice(b"abc");
        }
        assert_eq!(pool.available(), 1);
        let b = pool.acquire();
        assert!(b.is_empty(), "released buffers come back cleared");
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }
}
