//! Sequential Writer
//!
//! Appends payloads at a monotonically increasing cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{OffloadError, Result};
use crate::io::{self, AsyncIo, BackendKind, BufferHandle, Direction, Request, WaitMode};
use crate::memory::{DeviceBuffer, OffloadBuffer, PinGuard, PinnedBuffer};

use super::keepalive::{KeepAlive, Owner};
use super::staging::{CopyJob, CopyStream, StagedCopy};

/// Append-only writer over one file
///
/// ## Cursor
/// Every append reserves `[offset, offset + len)` before anything is
/// submitted, so the layout of the file is known ahead of completion.
///
/// ## Ownership
/// Each payload is parked in the keep-alive table until its write
/// completes. Device payloads additionally hold their staging buffer.
///
/// ## Errors
/// Write failures and failed device copies are reported by the next
/// `synchronize()`.
pub struct SequentialWriter {
    /// Backend; declared before `file` so it is dropped first
    io: Box<dyn AsyncIo>,

    file: File,
    fd: RawFd,

    /// Next byte to be assigned
    offset: u64,

    keep_alive: KeepAlive,

    /// Started on the first device append
    copies: Option<CopyStream>,

    /// First failed device copy
    copy_error: Option<OffloadError>,
}

impl SequentialWriter {
    /// Writer over an open file, starting at offset 0
    pub fn new(file: File, queue_depth: usize, backend: BackendKind) -> Result<Self> {
        let io = io::open_backend(backend, queue_depth)?;
        let fd = file.as_raw_fd();

        tracing::debug!(backend = %backend, queue_depth, "sequential writer ready");

        Ok(Self {
            io,
            file,
            fd,
            offset: 0,
            keep_alive: KeepAlive::new(),
            copies: None,
            copy_error: None,
        })
    }

    /// Create (or truncate) `path` and write into it
    pub fn create(path: impl AsRef<Path>, queue_depth: usize, backend: BackendKind) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::new(file, queue_depth, backend)
    }

    /// Next offset to be assigned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Appends not yet completed (staged copies included)
    pub fn outstanding(&self) -> usize {
        self.io.outstanding(None) + self.copies.as_ref().map_or(0, CopyStream::pending)
    }

    /// Payloads still held by the keep-alive table
    pub fn held_payloads(&self) -> usize {
        self.keep_alive.len()
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Append `data`; returns the number of bytes assigned
    pub fn append(&mut self, data: impl Into<Bytes>) -> Result<usize> {
        let data: Bytes = data.into();
        let len = data.len();
        let handle = BufferHandle::from(&data[..]);
        let offset = self.offset;

        // `data` moves into the keep-alive table; its heap bytes stay put.
        unsafe { self.submit_write(Box::new(data), handle, offset)? };
        self.offset += len as u64;

        self.submit_staged()?;
        Ok(len)
    }

    /// Write `handle` at an explicit `offset`, keeping `owner` alive until done
    ///
    /// The cursor still advances by the handle's length.
    ///
    /// # Safety
    /// The memory behind `handle` must stay valid and unmodified at least as
    /// long as `owner` is alive.
    pub unsafe fn append_raw(&mut self, owner: Owner, handle: BufferHandle, offset: u64) -> Result<()> {
        self.submit_write(owner, handle, offset)?;
        self.offset += handle.len() as u64;
        self.submit_staged()
    }

    /// Append an offload buffer's storage
    ///
    /// The buffer stays pinned until its write completes.
    pub fn append_buffer(&mut self, buffer: &OffloadBuffer) -> Result<usize> {
        let (pins, handles) = PinGuard::acquire(std::slice::from_ref(buffer), Direction::Write)?;
        let handle = handles[0];
        let len = handle.len();
        let offset = self.offset;

        // Dropping the guard from the keep-alive table unpins the buffer.
        unsafe { self.submit_write(Box::new(pins), handle, offset)? };
        self.offset += len as u64;

        self.submit_staged()?;
        Ok(len)
    }

    /// Append a device-resident payload through a pinned staging buffer
    ///
    /// The range is assigned now; the copy runs on the copy stream and the
    /// write is submitted once the copy has finished. Without `staging` a
    /// buffer of the payload's size is allocated.
    pub fn append_device(&mut self, source: Arc<dyn DeviceBuffer>, staging: Option<PinnedBuffer>) -> Result<usize> {
        let len = source.nbytes();
        let staging = match staging {
            Some(buf) if buf.len() < len => {
                return Err(OffloadError::Staging(format!(
                    "staging buffer holds {} bytes, payload needs {}",
                    buf.len(),
                    len
                )));
            }
            Some(buf) => buf,
            None => PinnedBuffer::new(len),
        };

        let offset = self.offset;
        if self.copies.is_none() {
            self.copies = Some(CopyStream::spawn()?);
        }
        let copies = self
            .copies
            .as_mut()
            .ok_or_else(|| OffloadError::Staging("copy stream unavailable".to_string()))?;
        copies.enqueue(CopyJob { source, staging, offset })?;
        self.offset += len as u64;

        self.submit_staged()?;
        Ok(len)
    }

    /// Kept for stream-like callers; appends are already queued
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until every append has been written
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn synchronize(&mut self) -> Result<()> {
        let staged = match self.copies.as_mut() {
            Some(copies) => copies.wait_finished(),
            None => Ok(Vec::new()),
        };
        let submitted = staged.and_then(|copies| {
            copies
                .into_iter()
                .map(|copy| self.submit_copy(copy))
                .fold(Ok(()), |acc: Result<()>, r| acc.and(r))
        });

        let drained = self.io.reap(WaitMode::All).map(|_| ());

        submitted?;
        if let Some(error) = self.copy_error.take() {
            return Err(error);
        }
        drained
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// # Safety
    /// `handle` must stay valid while `owner` is alive.
    unsafe fn submit_write(&mut self, owner: Owner, handle: BufferHandle, offset: u64) -> Result<()> {
        let slot = self.keep_alive.hold(owner);
        let request =
            Request::write(self.fd, vec![handle], offset).on_complete(self.keep_alive.release_on_complete(slot));
        self.io.submit(request).map(|_| ())
    }

    /// Submit writes for copies that have already finished
    fn submit_staged(&mut self) -> Result<()> {
        let finished = match self.copies.as_mut() {
            Some(copies) => copies.try_finished(),
            None => return Ok(()),
        };
        for copy in finished {
            self.submit_copy(copy)?;
        }
        Ok(())
    }

    fn submit_copy(&mut self, copy: StagedCopy) -> Result<()> {
        let len = copy.len();
        let StagedCopy {
            source,
            mut staging,
            offset,
            result,
        } = copy;

        if let Err(e) = result {
            tracing::warn!(error = %e, offset, "device copy failed");
            if self.copy_error.is_none() {
                self.copy_error = Some(OffloadError::Staging(format!("device copy at offset {} failed: {}", offset, e)));
            }
            return Ok(());
        }

        let handle = staging.handle(len);
        // The staging heap block does not move with the value.
        unsafe { self.submit_write(Box::new((staging, source)), handle, offset) }
    }
}

/// Best-effort drain so no write outlives its payload.
impl Drop for SequentialWriter {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize() {
            tracing::warn!(error = %e, "sequential writer teardown failed");
        }
    }
}
