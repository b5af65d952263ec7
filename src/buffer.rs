//! Request buffer pool.
//!
//! Every in-flight request owns one buffer for the lifetime of its dispatch.
//! Buffers are sized for the largest possible request (a full write payload
//! plus headers) and aligned for `fuse_in_header`, since the typed decoders
//! read structs in place.

use parking_lot::Mutex;

use crate::ll::fuse_abi::fuse_in_header;

/// The max size of write requests from the kernel. The absolute minimum is
/// 4k, FUSE recommends at least 128k, max 16M.
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Size of a receive buffer. The kernel may send up to `MAX_WRITE_SIZE` bytes
/// of payload, plus headers and argument structs.
pub(crate) const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

/// One pooled receive buffer. The usable region starts at an aligned offset
/// inside the allocation.
pub(crate) struct RequestBuffer {
    data: Vec<u8>,
    start: usize,
}

impl RequestBuffer {
    fn new(size: usize) -> Self {
        let align = align_of::<fuse_in_header>();
        let data = vec![0u8; size + align];
        let off = data.as_ptr() as usize % align;
        let start = if off == 0 { 0 } else { align - off };
        RequestBuffer { data, start }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.data[start..]
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }
}

impl std::fmt::Debug for RequestBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuffer")
            .field("len", &self.as_slice().len())
            .finish()
    }
}

/// A free list of request buffers.
///
/// `acquire` never blocks: it pops a pooled buffer or allocates a fresh one.
/// `release` retains up to `max_idle` buffers and drops the rest. Buffers are
/// not zeroed between uses; only the bytes the channel reports as received
/// are meaningful.
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<RequestBuffer>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub(crate) fn new(buffer_size: usize, max_idle: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    pub(crate) fn acquire(&self) -> RequestBuffer {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        RequestBuffer::new(self.buffer_size)
    }

    pub(crate) fn release(&self, buf: RequestBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_header_aligned() {
        let mut buf = RequestBuffer::new(4096);
        let align = align_of::<fuse_in_header>();
        assert_eq!(buf.as_mut_slice().as_ptr() as usize % align, 0);
        assert!(buf.as_mut_slice().len() >= 4096);
    }

    #[test]
    fn pool_reuses_and_caps_retention() {
        let pool = BufferPool::new(1024, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        pool.release(a);
        pool.release(b);
        pool.release(c);
        // The third release exceeds max_idle and is dropped.
        assert_eq!(pool.idle_count(), 2);
        let _ = pool.acquire();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn reused_buffer_is_not_zeroed() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire();
        buf.as_mut_slice()[0] = 0xaa;
        pool.release(buf);
        let buf = pool.acquire();
        assert_eq!(buf.as_slice()[0], 0xaa);
    }
}
