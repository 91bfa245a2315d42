//! The TCP data plane: the simple request/response listener, the ASCII
//! request codec, the pooled client, and the multiplexed peer transport.

pub mod client;
pub mod mux;
pub mod request;
pub mod server;

use crossbeam_queue::ArrayQueue;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Payloads below this size are served through a pooled buffer instead of
/// `sendfile`.
pub const MIN_SENDFILE_SIZE: u64 = 4096;

/// Size of each pooled transfer buffer.
pub const POOL_BUFFER_SIZE: usize = 64 * 1024;

/// Chunk size used when copying between handles.
pub const COPY_BUFFER_SIZE: usize = 1 << 20;

/// Idle timeout on data-plane connections.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Connections opened towards a single peer.
pub const CONNECTIONS_PER_PEER: usize = 8;

const BUFFER_ALIGNMENT: usize = 4096;

/// A page-aligned transfer buffer.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned and carries no interior pointers to shared
// state.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new() -> Self {
        let layout = Layout::from_size_align(POOL_BUFFER_SIZE, BUFFER_ALIGNMENT)
            .expect("pool buffer layout is valid");
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the allocation is POOL_BUFFER_SIZE bytes and lives as long
        // as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), POOL_BUFFER_SIZE) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the mutable borrow is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), POOL_BUFFER_SIZE) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated with the identical layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Bounded lock-free stack of page-aligned buffers. Buffers returned to a
/// full pool are freed instead.
pub struct BufferPool {
    buffers: ArrayQueue<AlignedBuffer>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
        }
    }

    pub fn get(&self) -> AlignedBuffer {
        self.buffers.pop().unwrap_or_else(AlignedBuffer::new)
    }

    pub fn put(&self, buffer: AlignedBuffer) {
        let _ = self.buffers.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_page_aligned_and_zeroed() {
        let buffer = AlignedBuffer::new();
        assert_eq!(buffer.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
        assert_eq!(buffer.len(), POOL_BUFFER_SIZE);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn pool_recycles_up_to_capacity() {
        let pool = BufferPool::new(2);
        let mut a = pool.get();
        a[0] = 7;
        let marker = a.as_ptr();
        pool.put(a);

        let again = pool.get();
        assert_eq!(again.as_ptr(), marker);
        // A full pool drops extra buffers rather than growing.
        pool.put(again);
        pool.put(AlignedBuffer::new());
        pool.put(AlignedBuffer::new());
        assert!(pool.buffers.len() <= 2);
    }
}
