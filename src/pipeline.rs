//! Prefetch Pipeline
//!
//! Drives an iteration over offloaded items (one buffer or a buffer group
//! per step) so that reads for upcoming steps overlap the current step and
//! write-back of finished ones.
//!
//! ## Schedule (depth d)
//! ```text
//!  async_read(0..d)
//!  for i in 0..n:
//!      sync_read_events()            item i is resident
//!      async_read(i + d)             if in range
//!      step(i)
//!      sync_write_events()           at most one write-back in flight
//!      async_write(i)
//!  synchronize()
//! ```
//!
//! With depth 0 every step is a plain sync read, step, sync write.

use crate::error::Result;
use crate::memory::OffloadBuffer;
use crate::offloader::DiskOffloader;

/// Something the offloader can move to disk and back as one key
pub trait Offloadable {
    fn sync_read(&self, offloader: &DiskOffloader) -> Result<()>;
    fn sync_write(&self, offloader: &DiskOffloader) -> Result<()>;
    fn async_read(&self, offloader: &DiskOffloader) -> Result<()>;
    fn async_write(&self, offloader: &DiskOffloader) -> Result<()>;
}

impl Offloadable for OffloadBuffer {
    fn sync_read(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.sync_read(self)
    }

    fn sync_write(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.sync_write(self)
    }

    fn async_read(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.async_read(self, None)
    }

    fn async_write(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.async_write(self, None)
    }
}

/// A group is transferred as one vectorized request
impl Offloadable for Vec<OffloadBuffer> {
    fn sync_read(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.sync_readv(self)
    }

    fn sync_write(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.sync_writev(self)
    }

    fn async_read(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.async_readv(self, None)
    }

    fn async_write(&self, offloader: &DiskOffloader) -> Result<()> {
        offloader.async_writev(self, None)
    }
}

/// Read-ahead / write-back driver with a fixed prefetch depth
pub struct PrefetchPipeline<'a> {
    offloader: &'a DiskOffloader,

    /// Steps whose reads are issued ahead of consumption
    depth: usize,
}

impl<'a> PrefetchPipeline<'a> {
    pub fn new(offloader: &'a DiskOffloader, depth: usize) -> Self {
        Self { offloader, depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Offload every item as-is (the state each run starts from)
    pub fn offload_all<T: Offloadable>(&self, items: &[T]) -> Result<()> {
        for item in items {
            item.sync_write(self.offloader)?;
        }
        Ok(())
    }

    /// Run `step` over every item; items must have been offloaded already
    ///
    /// Returns with every item written back and all I/O drained.
    pub fn run<T, F>(&self, items: &[T], mut step: F) -> Result<()>
    where
        T: Offloadable,
        F: FnMut(usize, &T) -> Result<()>,
    {
        if self.depth == 0 {
            for (i, item) in items.iter().enumerate() {
                item.sync_read(self.offloader)?;
                step(i, item)?;
                item.sync_write(self.offloader)?;
            }
            return Ok(());
        }

        for item in items.iter().take(self.depth) {
            item.async_read(self.offloader)?;
        }

        for (i, item) in items.iter().enumerate() {
            self.offloader.sync_read_events()?;
            if let Some(next) = items.get(i + self.depth) {
                next.async_read(self.offloader)?;
            }

            step(i, item)?;

            self.offloader.sync_write_events()?;
            item.async_write(self.offloader)?;
        }

        tracing::trace!(items = items.len(), depth = self.depth, "pipeline pass done");
        self.offloader.synchronize()
    }
}
