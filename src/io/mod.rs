//! I/O Module
//!
//! Asynchronous file transfers over two kernel facilities behind one contract.
//!
//! ## Responsibilities
//! - Turn logical Requests (1..n buffers, one offset) into native ops
//! - Bound native ops in flight by the queue depth (submission blocks)
//! - Fire a Request's completion hook once all of its native ops finish
//! - Track outstanding reads and writes separately for the event barriers
//!
//! ## Request Lifecycle
//! ```text
//!  Created ──submit──▶ Submitted ──all native ops done──▶ Completed ──▶ Released
//!                          │                               (hook fired)
//!                          └─────── any op failed ───────▶ Failed(error)
//! ```
//!
//! ## Backends
//! - `uring`: one submission/completion ring; vectorized Requests map to
//!   native readv/writev when the kernel supports them
//! - `aio`: one kernel AIO context; vectorized Requests always decompose
//!   into one native op per buffer
//!
//! Completions are only reaped on the calling thread, from `submit`
//! (back-pressure), `reap` or `wait_for`. There is no background poller.

mod backend;
mod buffer;
mod probe;
mod request;

#[cfg(all(target_os = "linux", feature = "aio"))]
mod aio;
#[cfg(all(target_os = "linux", feature = "uring"))]
mod uring;

pub use backend::{AsyncIo, BackendKind};
pub use buffer::BufferHandle;
pub use probe::{get_backends, probe_backend};
pub use request::{Callback, CompletionHook, Request, RequestId};

#[cfg(all(target_os = "linux", feature = "aio"))]
pub use aio::AioIo;
#[cfg(all(target_os = "linux", feature = "uring"))]
pub use uring::UringIo;

use crate::error::{OffloadError, Result};

/// Transfer direction of a Request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// File → memory
    Read,

    /// Memory → file
    Write,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// How long `reap` blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Only process completions that are already available
    NoWait,

    /// Block until no Request of this direction is outstanding
    Direction(Direction),

    /// Block until no Request is outstanding
    All,
}

/// Create a backend after checking it is compiled in and usable on this host
///
/// Fails fast with `UnsupportedBackend` or `BackendUnavailable` instead of
/// silently picking another backend.
pub fn open_backend(kind: BackendKind, queue_depth: usize) -> Result<Box<dyn AsyncIo>> {
    if queue_depth == 0 {
        return Err(OffloadError::Config("queue depth must be at least 1".to_string()));
    }
    if !get_backends().contains(&kind) {
        return Err(OffloadError::UnsupportedBackend(kind.name().to_string()));
    }
    if let Err(reason) = probe::probe_cached(kind) {
        return Err(OffloadError::BackendUnavailable {
            backend: kind.name().to_string(),
            reason,
        });
    }

    let io = backend::create(kind, queue_depth)?;
    tracing::debug!(backend = %kind, queue_depth, "created async I/O backend");
    Ok(io)
}
