//! Device-resident memory.

use std::io;

/// Memory that lives on an accelerator and is copied to host before disk I/O
///
/// Implementations wrap a device allocation; `copy_to_host` runs on the
/// writer's dedicated copy stream, never on the caller's compute thread.
pub trait DeviceBuffer: Send + Sync + 'static {
    /// Size of the allocation in bytes
    fn nbytes(&self) -> usize;

    /// Copy the full contents into `dst` (`dst.len() == self.nbytes()`)
    fn copy_to_host(&self, dst: &mut [u8]) -> io::Result<()>;
}
