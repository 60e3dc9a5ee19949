//! Accounted byte-buffer arena.

use bytes::BytesMut;
use nidx_common::{ArenaConfig, IndexError, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Hands out byte buffers while keeping an exact count of bytes in use.
///
/// Every buffer is owned by exactly one `ScopedBuffer` and returns to the
/// arena when that guard drops. With pooling enabled, released buffers are
/// kept and reused for later requests of equal or smaller capacity.
pub struct BufferArena {
    /// Configuration.
    config: ArenaConfig,
    /// Bytes currently handed out.
    used_bytes: AtomicUsize,
    /// High-water mark of `used_bytes`.
    peak_bytes: AtomicUsize,
    /// Total number of successful allocations.
    allocations: AtomicU64,
    /// Released buffers available for reuse.
    pool: Mutex<Vec<BytesMut>>,
}

impl BufferArena {
    /// Creates a new arena.
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            used_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Creates an unbounded arena with default pooling.
    pub fn unbounded() -> Self {
        Self::new(ArenaConfig::default())
    }

    /// Creates an arena bounded to 10% of available system RAM.
    ///
    /// At least 16 MiB is allowed so population still makes progress on
    /// low-memory systems.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let max_bytes = (available_bytes / 10).max(16 * 1024 * 1024);

        Self::new(ArenaConfig {
            max_bytes: Some(max_bytes),
            ..ArenaConfig::default()
        })
    }

    /// Returns the configured byte limit, if any.
    pub fn max_bytes(&self) -> Option<usize> {
        self.config.max_bytes
    }

    /// Returns the number of bytes currently handed out.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Returns the number of buffers waiting in the pool.
    pub fn pooled_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Allocates a buffer with at least `capacity` bytes of room.
    ///
    /// Fails with `ArenaExhausted` when the request would push usage past
    /// the configured limit.
    pub fn allocate(self: &Arc<Self>, capacity: usize) -> Result<ScopedBuffer> {
        self.reserve(capacity)?;

        let buf = self
            .take_pooled(capacity)
            .unwrap_or_else(|| BytesMut::with_capacity(capacity));

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(ScopedBuffer {
            buf,
            capacity,
            arena: Arc::clone(self),
        })
    }

    /// Accounts for `capacity` bytes, respecting the limit.
    fn reserve(&self, capacity: usize) -> Result<()> {
        let mut used = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = used + capacity;
            if let Some(limit) = self.config.max_bytes {
                if next > limit {
                    return Err(IndexError::ArenaExhausted {
                        requested: capacity,
                        used,
                        limit,
                    });
                }
            }
            match self.used_bytes.compare_exchange_weak(
                used,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak_bytes.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Takes a pooled buffer large enough for `capacity`, if one exists.
    fn take_pooled(&self, capacity: usize) -> Option<BytesMut> {
        if !self.config.pooled {
            return None;
        }
        let mut pool = self.pool.lock();
        let idx = pool.iter().position(|b| b.capacity() >= capacity)?;
        let mut buf = pool.swap_remove(idx);
        buf.clear();
        Some(buf)
    }

    /// Returns a buffer to the arena.
    fn release(&self, buf: BytesMut, capacity: usize) {
        self.used_bytes.fetch_sub(capacity, Ordering::AcqRel);
        if self.config.pooled {
            let mut pool = self.pool.lock();
            if pool.len() < self.config.max_pooled_buffers {
                pool.push(buf);
            }
        }
    }

    /// Drops every pooled buffer.
    pub fn clear_pool(&self) {
        let released = {
            let mut pool = self.pool.lock();
            std::mem::take(&mut *pool)
        };
        debug!(buffers = released.len(), "cleared buffer arena pool");
    }

    /// Returns statistics about the arena.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            used_bytes: self.used_bytes(),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            pooled_buffers: self.pooled_count(),
        }
    }
}

/// Statistics about the buffer arena.
#[derive(Debug, Clone)]
pub struct ArenaStats {
    /// Bytes currently handed out.
    pub used_bytes: usize,
    /// Highest value `used_bytes` has reached.
    pub peak_bytes: usize,
    /// Number of allocations served.
    pub allocations: u64,
    /// Number of released buffers kept for reuse.
    pub pooled_buffers: usize,
}

/// Exclusively owned buffer that returns to its arena on drop.
pub struct ScopedBuffer {
    buf: BytesMut,
    capacity: usize,
    arena: Arc<BufferArena>,
}

impl ScopedBuffer {
    /// Returns the number of bytes this buffer accounts for in the arena.
    pub fn accounted_capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the remaining room before reaching the accounted capacity.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

impl Deref for ScopedBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for ScopedBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.arena.release(buf, self.capacity);
    }
}

impl std::fmt::Debug for ScopedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
