//! # nvme-offload
//!
//! Offloads large in-memory buffers to NVMe and restores them on demand:
//! - Backing-file space manager with free-list reuse
//! - Two kernel async I/O backends (io_uring, Linux AIO) behind one trait
//! - Keyed sync/async, single/vectorized reads and writes
//! - Per-direction barriers for prefetch pipelines
//! - Append-only writer with device → host staged copies
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │ DiskOffloader / Pipeline     │      │      SequentialWriter        │
//! │ (buffer identity → key)      │      │ (cursor, keep-alive, copies) │
//! └──────────────┬───────────────┘      └──────────────┬───────────────┘
//!                │                                     │
//! ┌──────────────▼───────────────┐                     │
//! │        OffloadStore          │                     │
//! │   (key table + catalog lock) │                     │
//! └──────┬───────────────┬───────┘                     │
//!        │               │                             │
//!        ▼               ▼                             │
//! ┌─────────────┐ ┌─────────────────────────────────────▼─┐
//! │SpaceManager │ │           AsyncIo (backend)           │
//! │ (free list) │ │   ┌─────────────┐   ┌─────────────┐   │
//! └─────────────┘ │   │  io_uring   │   │  Linux AIO  │   │
//!                 │   └─────────────┘   └─────────────┘   │
//!                 └───────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod space;
pub mod io;
pub mod memory;
pub mod store;
pub mod offloader;
pub mod writer;
pub mod pipeline;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use error::{OffloadError, Result};
pub use io::{get_backends, probe_backend, BackendKind};
pub use memory::{DeviceBuffer, OffloadBuffer, PinnedBuffer};
pub use offloader::DiskOffloader;
pub use pipeline::PrefetchPipeline;
pub use store::OffloadStore;
pub use writer::SequentialWriter;

/// First compiled-in backend that works on this host
pub fn default_backend() -> Option<BackendKind> {
    get_backends().into_iter().find(|kind| probe_backend(kind.name()))
}

// =============================================================================
// Version Info
// =============================================================================

/// Current version of nvme-offload
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
