//! Host buffers with releasable storage

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{OffloadError, Result};
use crate::io::{BufferHandle, CompletionHook, Direction};

/// Source of buffer identities (stable for the buffer's lifetime)
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A host buffer of fixed logical size whose storage can come and go
///
/// Cloning shares the same storage. After a buffer has been offloaded its
/// storage is released (`storage_size() == 0`) while `nbytes()` still
/// reports the logical size; reading it back re-materializes the storage.
///
/// ## Concurrency:
/// - `storage`: parking_lot Mutex, held only for short accessors
/// - Every Request targeting the storage pins it until the Request has
///   finished (successfully or not)
/// - While a read is pinned the bytes cannot be accessed; while any
///   transfer is pinned they cannot be modified, released or replaced.
///   Refused calls return `BufferBusy`
#[derive(Clone)]
pub struct OffloadBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    nbytes: usize,
    storage: Mutex<Storage>,
}

struct Storage {
    bytes: Option<Box<[u8]>>,

    /// Outstanding Requests per direction (`Direction::index`)
    pins: [usize; 2],
}

impl Storage {
    fn is_pinned(&self) -> bool {
        self.pins.iter().any(|&n| n > 0)
    }
}

impl OffloadBuffer {
    /// Zero-filled buffer of `nbytes`
    pub fn zeroed(nbytes: usize) -> Self {
        Self::from_vec(vec![0u8; nbytes])
    }

    /// Take ownership of `bytes` as the buffer's storage
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                nbytes: bytes.len(),
                storage: Mutex::new(Storage {
                    bytes: Some(bytes.into_boxed_slice()),
                    pins: [0, 0],
                }),
            }),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Buffer holding `values` as little-endian f32
    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_vec(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Storage decoded as little-endian f32
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        self.with_bytes(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }

    /// Identity used to derive offload keys
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Logical size in bytes (unchanged by release)
    pub fn nbytes(&self) -> usize {
        self.inner.nbytes
    }

    /// Bytes of storage currently held (0 when released)
    pub fn storage_size(&self) -> usize {
        self.inner.storage.lock().bytes.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_released(&self) -> bool {
        self.inner.storage.lock().bytes.is_none()
    }

    /// Whether a transfer targeting the storage is outstanding
    pub fn is_pinned(&self) -> bool {
        self.inner.storage.lock().is_pinned()
    }

    /// Drop the storage, keeping the logical size
    pub fn release_storage(&self) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        if storage.is_pinned() {
            return Err(self.busy());
        }
        storage.bytes = None;
        Ok(())
    }

    /// Allocate zeroed storage if it has been released
    pub fn materialize(&self) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        if storage.is_pinned() {
            return Err(self.busy());
        }
        if storage.bytes.is_none() {
            storage.bytes = Some(vec![0u8; self.inner.nbytes].into_boxed_slice());
        }
        Ok(())
    }

    /// Copy of the storage
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_bytes(|bytes| bytes.to_vec())
    }

    /// Run `f` over the bytes; refused while a read is outstanding
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let storage = self.inner.storage.lock();
        if storage.pins[Direction::Read.index()] > 0 {
            return Err(self.busy());
        }
        storage.bytes.as_deref().map(f).ok_or(OffloadError::EmptyStorage)
    }

    /// Run `f` over the bytes mutably; refused while any transfer is outstanding
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut storage = self.inner.storage.lock();
        if storage.is_pinned() {
            return Err(self.busy());
        }
        storage.bytes.as_deref_mut().map(f).ok_or(OffloadError::EmptyStorage)
    }

    /// Pin the storage for one Request and return its address
    ///
    /// - `Write`: the storage must be resident and not being read into
    /// - `Read`: no other transfer may be outstanding; released storage is
    ///   re-materialized first
    ///
    /// Each successful call must be paired with one `unpin`.
    pub(crate) fn pin(&self, direction: Direction) -> Result<BufferHandle> {
        let mut storage = self.inner.storage.lock();
        match direction {
            Direction::Write if storage.pins[Direction::Read.index()] > 0 => return Err(self.busy()),
            Direction::Read if storage.is_pinned() => return Err(self.busy()),
            Direction::Read if storage.bytes.is_none() => {
                storage.bytes = Some(vec![0u8; self.inner.nbytes].into_boxed_slice());
            }
            _ => {}
        }

        let handle = storage
            .bytes
            .as_deref_mut()
            .map(BufferHandle::from)
            .ok_or(OffloadError::EmptyStorage)?;
        storage.pins[direction.index()] += 1;
        Ok(handle)
    }

    pub(crate) fn unpin(&self, direction: Direction) {
        let mut storage = self.inner.storage.lock();
        let pins = &mut storage.pins[direction.index()];
        if *pins == 0 {
            tracing::warn!(buffer = self.inner.id, ?direction, "unpin without matching pin");
            return;
        }
        *pins -= 1;
    }

    fn busy(&self) -> OffloadError {
        OffloadError::BufferBusy { id: self.inner.id }
    }
}

impl fmt::Debug for OffloadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.inner.storage.lock();
        f.debug_struct("OffloadBuffer")
            .field("id", &self.inner.id)
            .field("nbytes", &self.inner.nbytes)
            .field("storage_size", &storage.bytes.as_ref().map_or(0, |s| s.len()))
            .field("pins", &storage.pins)
            .finish()
    }
}

// =============================================================================
// Pin Guard
// =============================================================================

/// Pins held by one Request; dropping the guard unpins every buffer
///
/// The guard lives inside the Request (as a completion hook or keep-alive
/// owner), so the pins end exactly when the backend lets go of the Request.
pub(crate) struct PinGuard {
    buffers: Vec<OffloadBuffer>,
    direction: Direction,
}

impl PinGuard {
    /// Pin every buffer, or none of them
    pub fn acquire(buffers: &[OffloadBuffer], direction: Direction) -> Result<(Self, Vec<BufferHandle>)> {
        let mut guard = Self {
            buffers: Vec::with_capacity(buffers.len()),
            direction,
        };
        let mut handles = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            // On error the partially filled guard unpins what it holds.
            handles.push(buffer.pin(direction)?);
            guard.buffers.push(buffer.clone());
        }
        Ok((guard, handles))
    }

    /// Hook that releases the pins when the Request finishes
    pub fn into_hook(self) -> CompletionHook {
        Box::new(move |outcome| {
            drop(self);
            outcome
        })
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        for buffer in &self.buffers {
            buffer.unpin(self.direction);
        }
    }
}
