use std::sync::Arc;

use tokio::sync::Mutex;

/// Upper bound on buffers retained per pool to avoid memory bloat.
const MAX_POOL_SIZE: usize = 64;

/// Free-list of fixed-size byte buffers for the relay hot paths.
///
/// One pool instance serves one size class: the client keeps a pool of
/// upload read buffers, the server a pool of download read buffers. Buffers
/// are zeroed on return so recycled memory never leaks bytes between
/// sessions.
pub struct BufferPool {
    buf_len: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of exactly `buf_len` bytes.
    pub fn new(buf_len: usize) -> Arc<Self> {
        Arc::new(Self {
            buf_len,
            buffers: Mutex::new(Vec::new()),
        })
    }

    /// Get a buffer from the pool or allocate a new one.
    pub async fn get(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        if let Some(buffer) = pool.pop() {
            debug_assert_eq!(buffer.len(), self.buf_len);
            buffer
        } else {
            vec![0u8; self.buf_len]
        }
    }

    /// Return a buffer to the pool for reuse.
    ///
    /// Buffers whose capacity no longer matches the pool's size class are
    /// dropped rather than retained.
    pub async fn put(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.buf_len || buffer.capacity() > self.buf_len * 2 {
            return;
        }

        buffer.clear();
        buffer.resize(self.buf_len, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of buffers currently idle in the pool.
    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

/// RAII lease that returns its buffer to the pool on drop
pub struct BufferLease {
    pool: Arc<BufferPool>,
    buffer: Option<Vec<u8>>,
}

impl BufferLease {
    /// Pull a buffer out of `pool`, tying its lifetime to the lease.
    pub async fn acquire(pool: &Arc<BufferPool>) -> Self {
        let buffer = pool.get().await;
        Self {
            pool: Arc::clone(pool),
            buffer: Some(buffer),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer
            .as_mut()
            .expect("buffer should be present")
            .as_mut_slice()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer
            .as_ref()
            .expect("buffer should be present")
            .as_slice()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let pool = Arc::clone(&self.pool);
            // Return the buffer asynchronously without blocking drop
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.put(buffer).await;
                });
            }
        }
    }
}
