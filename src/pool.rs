use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

pub const BUF_SIZE: usize = 32 * 1024;

const DEFAULT_MAX_IDLE: usize = 256;

struct Inner {
    free: Mutex<Vec<Box<[u8]>>>,
    max_idle: usize,
}

/// Free-list of fixed-size read buffers shared by every session.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
                max_idle,
            }),
        }
    }

    /// Check out a buffer. It goes back to the pool when the guard drops.
    pub fn get(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; BUF_SIZE].into_boxed_slice());
        PooledBuf {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

pub struct PooledBuf {
    buf: Box<[u8]>,
    pool: Arc<Inner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_idle {
            free.push(buf);
        }
    }
}
