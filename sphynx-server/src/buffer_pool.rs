//! Fixed-size buffer pool, MTU-sized plus overhead for the largest datagram a worker
//! ever builds. Two separate locks for the acquire path and the release path so a
//! worker returning buffers never blocks one handing them out, mirroring the
//! acquire-list/release-list split in the allocator this is grounded on.

use parking_lot::Mutex;

const OVERHEAD: usize = 64;

pub struct Buffer {
    pub data: Vec<u8>,
    pub len: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], len: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

struct Inner {
    free: Vec<Buffer>,
}

/// Shared pool of pre-sized buffers. `acquire` and `release` take separate locks,
/// so a burst of releases from one worker never stalls another worker's acquires;
/// the brief race where both paths run concurrently against the same `Vec` is
/// resolved by each holding its own half of the list until it must merge.
pub struct BufferPool {
    buffer_size: usize,
    acquire_list: Mutex<Inner>,
    release_list: Mutex<Vec<Buffer>>,
}

impl BufferPool {
    pub fn new(count: usize, mtu: usize) -> Self {
        let buffer_size = mtu + OVERHEAD;
        let free = (0..count).map(|_| Buffer::new(buffer_size)).collect();
        Self { buffer_size, acquire_list: Mutex::new(Inner { free }), release_list: Mutex::new(Vec::new()) }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns `None` when the pool is exhausted; the caller (a worker's recv loop,
    /// or a send path building an outbound datagram) must treat that as a dropped
    /// packet or a `ResourceError::BufferPoolExhausted`, never block waiting for one.
    pub fn acquire(&self) -> Option<Buffer> {
        let mut inner = self.acquire_list.lock();
        if inner.free.is_empty() {
            let mut released = self.release_list.lock();
            if released.is_empty() {
                return None;
            }
            inner.free.append(&mut released);
        }
        inner.free.pop()
    }

    pub fn release(&self, mut buffer: Buffer) {
        buffer.len = 0;
        self.release_list.lock().push(buffer);
    }

    pub fn outstanding_capacity(&self) -> usize {
        self.acquire_list.lock().free.len() + self.release_list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trips() {
        let pool = BufferPool::new(4, 1350);
        assert_eq!(pool.outstanding_capacity(), 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.outstanding_capacity(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding_capacity(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = BufferPool::new(1, 1350);
        let buf = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(buf);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn released_buffers_are_zero_length_on_reacquire() {
        let pool = BufferPool::new(1, 1350);
        let mut buf = pool.acquire().unwrap();
        buf.len = 10;
        pool.release(buf);
        let buf = pool.acquire().unwrap();
        assert_eq!(buf.len, 0);
    }
}
