//! Scratch buffers for staging disk images.
//!
//! Building a disk image needs temporary byte buffers that are acquired,
//! grown in place, and released on every exit path, including errors. The
//! pool hands buffers out as RAII guards so release is guaranteed by drop,
//! and keeps returned buffers around so steady-state reconciliation does
//! not allocate.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// A pool of reusable byte buffers.
///
/// # Example
///
/// ```rust
/// use burrow_common::memory::ScratchPool;
///
/// let pool = ScratchPool::new();
/// {
///     let mut buf = pool.get(4096);
///     assert!(buf.len() >= 4096);
///     buf[0] = 0xFF;
/// }
/// // Buffer returned to the pool on drop.
/// assert_eq!(pool.pooled(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ScratchPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl ScratchPool {
    /// Creates an empty scratch pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a buffer of at least `size` bytes, zero-filled up to `size`.
    ///
    /// The buffer's capacity is never smaller than its length, and the
    /// buffer may be grown in place by the caller.
    pub fn get(&self, size: usize) -> ScratchBuf<'_> {
        let mut buf = self.bufs.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        ScratchBuf { pool: self, buf }
    }

    /// Returns the number of buffers currently parked in the pool.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.bufs.lock().len()
    }

    fn put_back(&self, buf: Vec<u8>) {
        self.bufs.lock().push(buf);
    }
}

/// RAII guard for a pooled scratch buffer.
///
/// Dereferences to `Vec<u8>`; the buffer returns to its pool when the guard
/// is dropped, on success and error paths alike.
pub struct ScratchBuf<'a> {
    pool: &'a ScratchPool,
    buf: Vec<u8>,
}

impl ScratchBuf<'_> {
    /// Consumes the guard, detaching the buffer from the pool.
    #[must_use]
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for ScratchBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for ScratchBuf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for ScratchBuf<'_> {
    fn drop(&mut self) {
        if self.buf.capacity() > 0 {
            self.pool.put_back(std::mem::take(&mut self.buf));
        }
    }
}

impl std::fmt::Debug for ScratchBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}
