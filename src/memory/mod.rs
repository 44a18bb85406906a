//! Memory Module
//!
//! Buffers the offload engine transfers from and into.
//!
//! ## Kinds
//! - `OffloadBuffer`: host buffer whose storage can be released after it
//!   has been written back and re-materialized before it is read again
//! - `PinnedBuffer`: page-locked host memory used as a staging target
//! - `DeviceBuffer`: device-resident memory that can copy itself to host
//!
//! The engine never copies buffer memory except through the explicit
//! device → pinned staging path of the sequential writer.

mod device;
mod host;
mod pinned;

pub use device::DeviceBuffer;
pub use host::OffloadBuffer;
pub(crate) use host::PinGuard;
pub use pinned::PinnedBuffer;
