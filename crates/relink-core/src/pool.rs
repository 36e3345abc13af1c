/// A pool of reusable byte buffers sized for one datagram each.
///
/// Connections draw buffers for outgoing packets and retransmission
/// storage from here and return them once the packet is acknowledged or
/// the connection is destroyed, keeping the hot path free of per-packet
/// allocation.
pub struct BufferPool {
    /// Buffers ready for reuse.
    pool: Vec<Vec<u8>>,
    /// Capacity given to freshly created buffers.
    buffer_size: usize,
    /// Buffers beyond this are dropped instead of pooled.
    max_pool_size: usize,
}

impl BufferPool {
    /// Creates a pool with `start_size` buffers pre-allocated.
    pub fn new(buffer_size: usize, start_size: usize, max_pool_size: usize) -> Self {
        let start = start_size.min(max_pool_size);
        let mut pool = Vec::with_capacity(start);
        for _ in 0..start {
            pool.push(Vec::with_capacity(buffer_size));
        }
        Self { pool, buffer_size, max_pool_size }
    }

    /// Takes a cleared buffer from the pool, or creates one.
    pub fn take(&mut self) -> Vec<u8> {
        self.pool.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Returns a buffer for reuse. The buffer is cleared here so callers
    /// never observe stale bytes.
    pub fn put(&mut self, mut buffer: Vec<u8>) {
        if self.pool.len() < self.max_pool_size {
            buffer.clear();
            self.pool.push(buffer);
        }
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Drops all pooled buffers.
    pub fn clear(&mut self) {
        self.pool.clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_MTU, 100, 5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preallocates_start_size() {
        let pool = BufferPool::new(128, 10, 50);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_take_and_put_reuses() {
        let mut pool = BufferPool::new(128, 0, 10);
        assert_eq!(pool.available(), 0);

        let mut buf = pool.take();
        assert!(buf.capacity() >= 128);
        buf.extend_from_slice(&[1, 2, 3]);

        pool.put(buf);
        assert_eq!(pool.available(), 1);

        // returned buffers come back cleared
        let buf = pool.take();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_pool_size_enforced() {
        let mut pool = BufferPool::new(128, 0, 2);
        for _ in 0..5 {
            pool.put(Vec::new());
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_start_size_capped_by_max() {
        let pool = BufferPool::new(128, 100, 10);
        assert_eq!(pool.available(), 10);
    }
}
