// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Reference counted payload buffers and the shared pool they are rented from.

use std::sync::{Arc, Mutex, Weak};

/// Smallest buffer size class handed out by the pool.
const MIN_CLASS: usize = 256;
/// Free buffers retained per size class.
const CLASS_CAP: usize = 64;

/// A shared pool of reusable byte buffers, segregated into power-of-two size
/// classes. Buffers are rented on packet construction and restored when the
/// last payload reference drops.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    max_len: usize,
}

impl BufferPool {
    /// Create a pool serving buffers up to `max_len` bytes.
    pub fn new(max_len: usize) -> Arc<Self> {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS;
        loop {
            classes.push(Mutex::new(Vec::new()));
            if size >= max_len {
                break;
            }
            size <<= 1;
        }
        Arc::new(Self { classes, max_len })
    }

    /// The largest payload this pool serves.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn class_of(&self, len: usize) -> usize {
        let mut idx = 0;
        let mut size = MIN_CLASS;
        while size < len && idx + 1 < self.classes.len() {
            idx += 1;
            size <<= 1;
        }
        idx
    }

    fn rent(&self, len: usize) -> Vec<u8> {
        let idx = self.class_of(len);
        let buf = {
            let mut free = self.classes[idx].lock().expect("buffer pool poisoned");
            free.pop()
        };
        buf.unwrap_or_else(|| Vec::with_capacity(MIN_CLASS << idx))
    }

    fn restore(&self, mut buf: Vec<u8>) {
        buf.clear();
        let idx = self.class_of(buf.capacity());
        let mut free = self.classes[idx].lock().expect("buffer pool poisoned");
        if free.len() < CLASS_CAP {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn free_count(&self, len: usize) -> usize {
        self.classes[self.class_of(len)].lock().unwrap().len()
    }
}

struct PooledBuf {
    bytes: Vec<u8>,
    pool: Weak<BufferPool>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // last reference gone, the buffer goes back to its pool
        if let Some(pool) = self.pool.upgrade() {
            pool.restore(std::mem::take(&mut self.bytes));
        }
    }
}

/// A reference counted holder of one contiguous immutable byte slice.
///
/// Cloning acquires a reference, dropping releases one; when the count reaches
/// zero a pooled buffer is restored to its pool. Ownership rules make any view
/// past the last release unrepresentable.
#[derive(Clone)]
pub struct Payload {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Empty,
    Shared(Arc<PooledBuf>),
}

impl Payload {
    /// The empty payload singleton, length 0.
    pub fn empty() -> Self {
        Self { repr: Repr::Empty }
    }

    /// Copy `bytes` into a buffer rented from `pool`; the returned payload is
    /// the first reference on it.
    pub fn from_pool(pool: &Arc<BufferPool>, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        let mut buf = pool.rent(bytes.len());
        buf.extend_from_slice(bytes);
        Self {
            repr: Repr::Shared(Arc::new(PooledBuf {
                bytes: buf,
                pool: Arc::downgrade(pool),
            })),
        }
    }

    /// Wrap an already owned buffer without pooling (inbound decode path).
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            repr: Repr::Shared(Arc::new(PooledBuf {
                bytes,
                pool: Weak::new(),
            })),
        }
    }

    /// A read-only view of the bytes.
    pub fn view(&self) -> &[u8] {
        match &self.repr {
            Repr::Empty => &[],
            Repr::Shared(buf) => &buf.bytes,
        }
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.view().len()
    }

    /// Whether this is the empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.len())
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_has_no_bytes() {
        let payload = Payload::empty();
        assert!(payload.is_empty());
        assert_eq!(payload.view(), &[] as &[u8]);
    }

    #[test]
    fn pooled_buffer_restored_on_last_release() {
        let pool = BufferPool::new(2 * 1024 * 1024);
        let payload = Payload::from_pool(&pool, b"hello stage");
        let second = payload.clone();
        assert_eq!(second.view(), b"hello stage");
        drop(payload);
        // one reference still alive, nothing restored yet
        assert_eq!(pool.free_count(11), 0);
        drop(second);
        assert_eq!(pool.free_count(11), 1);
    }

    #[test]
    fn restored_buffer_is_reused() {
        let pool = BufferPool::new(2 * 1024 * 1024);
        drop(Payload::from_pool(&pool, &[7u8; 100]));
        assert_eq!(pool.free_count(100), 1);
        let payload = Payload::from_pool(&pool, &[9u8; 80]);
        assert_eq!(pool.free_count(80), 0);
        assert_eq!(payload.view(), &[9u8; 80][..]);
    }

    #[test]
    fn size_classes_are_segregated() {
        let pool = BufferPool::new(2 * 1024 * 1024);
        drop(Payload::from_pool(&pool, &[1u8; 200]));
        drop(Payload::from_pool(&pool, &[1u8; 5000]));
        assert_eq!(pool.free_count(200), 1);
        assert_eq!(pool.free_count(5000), 1);
    }
}
