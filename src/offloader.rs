//! Disk Offloader
//!
//! Buffer-level offload: keys are derived from buffer identity and host
//! storage is released once its bytes are safely on disk.
//!
//! ## Buffer States
//! ```text
//!   resident ──write──▶ on disk (storage released) ──read──▶ resident
//!      ▲                                                       │
//!      └───────────────────────────────────────────────────────┘
//! ```
//!
//! - Sync writes release storage when they return; async writes release it
//!   in their completion callback (only on success)
//! - Reads re-materialize released storage before submitting
//! - Buffers are pinned from submission until the Request finishes
//! - A vectorized key is the ordered list of buffer identities, so reading
//!   a group in another order, or a subset of it, is a `KeyNotFound`

use crate::config::Config;
use crate::error::Result;
use crate::io::{Callback, Direction};
use crate::memory::{OffloadBuffer, PinGuard};
use crate::store::OffloadStore;

/// Offloads `OffloadBuffer`s to an `OffloadStore`
///
/// Every transfer pins its buffers until the backend has finished with it,
/// so the caller cannot release or modify storage the kernel still uses
/// (those calls return `BufferBusy`). Starting a second transfer on a
/// buffer that is being read into fails the same way.
pub struct DiskOffloader {
    store: OffloadStore,
}

impl DiskOffloader {
    /// Open a store with `config` and wrap it
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            store: OffloadStore::open(config)?,
        })
    }

    pub fn from_store(store: OffloadStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &OffloadStore {
        &self.store
    }

    /// Key of a single buffer
    pub fn key_of(buffer: &OffloadBuffer) -> String {
        buffer.id().to_string()
    }

    /// Key of an ordered buffer group
    pub fn group_key_of(buffers: &[OffloadBuffer]) -> String {
        let ids: Vec<String> = buffers.iter().map(|b| b.id().to_string()).collect();
        format!("[{}]", ids.join(","))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `buffer` and release its storage
    pub fn sync_write(&self, buffer: &OffloadBuffer) -> Result<()> {
        self.sync_write_keyed(Self::key_of(buffer), std::slice::from_ref(buffer))
    }

    /// Write all `buffers` under one key and release their storage
    pub fn sync_writev(&self, buffers: &[OffloadBuffer]) -> Result<()> {
        self.sync_write_keyed(Self::group_key_of(buffers), buffers)
    }

    /// Submit a write of `buffer`; its storage is released on completion
    pub fn async_write(&self, buffer: &OffloadBuffer, callback: Option<Callback>) -> Result<()> {
        self.async_write_keyed(Self::key_of(buffer), std::slice::from_ref(buffer), callback)
    }

    /// Submit a vectorized write; storage is released once all of it is written
    pub fn async_writev(&self, buffers: &[OffloadBuffer], callback: Option<Callback>) -> Result<()> {
        self.async_write_keyed(Self::group_key_of(buffers), buffers, callback)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `buffer` back, allocating its storage if needed
    pub fn sync_read(&self, buffer: &OffloadBuffer) -> Result<()> {
        self.read_keyed(Self::key_of(buffer), std::slice::from_ref(buffer), None, true)
    }

    /// Read a buffer group back in the order it was written
    pub fn sync_readv(&self, buffers: &[OffloadBuffer]) -> Result<()> {
        self.read_keyed(Self::group_key_of(buffers), buffers, None, true)
    }

    /// Submit a read of `buffer`
    pub fn async_read(&self, buffer: &OffloadBuffer, callback: Option<Callback>) -> Result<()> {
        self.read_keyed(Self::key_of(buffer), std::slice::from_ref(buffer), callback, false)
    }

    /// Submit a vectorized read of a buffer group
    pub fn async_readv(&self, buffers: &[OffloadBuffer], callback: Option<Callback>) -> Result<()> {
        self.read_keyed(Self::group_key_of(buffers), buffers, callback, false)
    }

    // =========================================================================
    // Barriers
    // =========================================================================

    pub fn sync_write_events(&self) -> Result<()> {
        self.store.sync_write_events()
    }

    pub fn sync_read_events(&self) -> Result<()> {
        self.store.sync_read_events()
    }

    pub fn synchronize(&self) -> Result<()> {
        self.store.synchronize()
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn sync_write_keyed(&self, key: String, buffers: &[OffloadBuffer]) -> Result<()> {
        let (pins, handles) = PinGuard::acquire(buffers, Direction::Write)?;
        // The pins live in the Request and end when the backend lets go of it.
        unsafe {
            self.store
                .write_handles(&key, handles, Some(pins.into_hook()), None, true)?
        };
        for buffer in buffers {
            buffer.release_storage()?;
        }
        Ok(())
    }

    fn async_write_keyed(&self, key: String, buffers: &[OffloadBuffer], callback: Option<Callback>) -> Result<()> {
        let (pins, handles) = PinGuard::acquire(buffers, Direction::Write)?;
        let written: Vec<OffloadBuffer> = buffers.to_vec();
        // Runs after the pin hook, so the storage is no longer pinned.
        let on_written: Callback = Box::new(move || {
            for buffer in &written {
                if let Err(e) = buffer.release_storage() {
                    tracing::warn!(error = %e, buffer = buffer.id(), "storage kept after async write");
                }
            }
            if let Some(callback) = callback {
                callback();
            }
        });
        unsafe {
            self.store
                .write_handles(&key, handles, Some(pins.into_hook()), Some(on_written), false)
        }
    }

    fn read_keyed(
        &self,
        key: String,
        buffers: &[OffloadBuffer],
        callback: Option<Callback>,
        blocking: bool,
    ) -> Result<()> {
        let (pins, handles) = PinGuard::acquire(buffers, Direction::Read)?;
        unsafe {
            self.store
                .read_handles(&key, handles, Some(pins.into_hook()), callback, blocking)
        }
    }
}
