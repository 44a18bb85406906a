//! Buffer handles
//!
//! Raw, caller-owned memory referenced by a Request.

/// Address + length of caller-owned memory
///
/// The engine never copies or frees this memory. Creating a handle is safe;
/// submitting it asynchronously is not, because the caller must keep the
/// memory alive and untouched until the Request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    ptr: *mut u8,
    len: usize,
}

// The handle is only an address; synchronization is the submitter's contract.
unsafe impl Send for BufferHandle {}
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    /// Reference `len` bytes starting at `ptr`
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as any Request built from this handle is outstanding.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl From<&mut [u8]> for BufferHandle {
    fn from(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }
}

/// Handles built from shared slices must only be used as write sources.
impl From<&[u8]> for BufferHandle {
    fn from(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }
    }
}
