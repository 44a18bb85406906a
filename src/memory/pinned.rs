//! Page-locked host memory.

use std::fmt;

use crate::io::BufferHandle;

/// Host buffer locked into RAM with `mlock`
///
/// Locking is best effort: when `RLIMIT_MEMLOCK` is too small the buffer is
/// still usable, only `is_locked()` reports `false`.
pub struct PinnedBuffer {
    data: Box<[u8]>,
    locked: bool,
}

impl PinnedBuffer {
    /// Allocate and lock `len` zeroed bytes
    pub fn new(len: usize) -> Self {
        let data = vec![0u8; len].into_boxed_slice();
        let locked = !data.is_empty() && unsafe { libc::mlock(data.as_ptr().cast(), data.len()) } == 0;
        if !locked && !data.is_empty() {
            tracing::debug!(
                bytes = len,
                error = %std::io::Error::last_os_error(),
                "mlock failed, staging buffer stays pageable"
            );
        }
        Self { data, locked }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the pages are actually locked
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Handle to the first `len` bytes
    pub(crate) fn handle(&mut self, len: usize) -> BufferHandle {
        BufferHandle::from(&mut self.data[..len])
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if self.locked {
            unsafe {
                libc::munlock(self.data.as_ptr().cast(), self.data.len());
            }
        }
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("len", &self.data.len())
            .field("locked", &self.locked)
            .finish()
    }
}
