//! Backend contract
//!
//! The `AsyncIo` trait and the identifiers of the compiled-in variants.

use std::fmt;
use std::str::FromStr;

use crate::error::{OffloadError, Result};

use super::{Direction, Request, RequestId, WaitMode};

/// Kernel async I/O facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Completion-queue based (io_uring)
    Uring,

    /// Classic kernel AIO (io_setup / io_submit / io_getevents)
    Aio,
}

impl BackendKind {
    /// Preference order used when no backend is named
    pub const ALL: [BackendKind; 2] = [BackendKind::Uring, BackendKind::Aio];

    /// Stable identifier used by `get_backends` and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Uring => "uring",
            BackendKind::Aio => "aio",
        }
    }

    /// First backend that probes successfully, or `Uring` if none does
    ///
    /// Falling back to `Uring` keeps construction honest: opening a store
    /// with it reports why the host cannot run it.
    pub fn default_available() -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| super::probe_backend(kind.name()))
            .unwrap_or(BackendKind::Uring)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uring" => Ok(BackendKind::Uring),
            "aio" => Ok(BackendKind::Aio),
            _ => Err(OffloadError::UnsupportedBackend(s.to_string())),
        }
    }
}

/// Submission/completion contract shared by both backends
///
/// ## Ordering
/// - A Request's hook runs only after all of its native ops complete
/// - Across Requests, completion order is unspecified
///
/// ## Errors
/// - Blocking Requests return their own outcome from `wait_for`
/// - Failures of other Requests are recorded and returned by the next
///   `reap` (the first one wins; later ones are logged)
pub trait AsyncIo: Send {
    /// Which facility this is
    fn kind(&self) -> BackendKind;

    /// Native ops allowed in flight
    fn queue_depth(&self) -> usize;

    /// Hand a Request to the kernel
    ///
    /// Blocks (reaping completions on this thread) while the queue is full.
    ///
    /// # Safety
    /// Every buffer of the Request must stay valid, and must not be
    /// accessed by anyone else, until the Request completes.
    unsafe fn submit(&mut self, request: Request) -> Result<RequestId>;

    /// Process completions; returns how many Requests completed
    fn reap(&mut self, mode: WaitMode) -> Result<usize>;

    /// Block until the given blocking Request completes and return its outcome
    fn wait_for(&mut self, id: RequestId) -> Result<()>;

    /// Whether the Request has native ops the kernel has not finished
    fn is_in_flight(&self, id: RequestId) -> bool;

    /// Stop waiting for a blocking Request; its outcome is dropped when it
    /// finishes (its hooks still run)
    fn abandon(&mut self, id: RequestId);

    /// Outstanding Requests of one direction, or of both with `None`
    fn outstanding(&self, direction: Option<Direction>) -> usize;

    /// Drain everything and release kernel resources
    fn close(&mut self) -> Result<()>;
}

/// Construct a backend without probing it
pub(crate) fn create(kind: BackendKind, queue_depth: usize) -> Result<Box<dyn AsyncIo>> {
    match kind {
        #[cfg(all(target_os = "linux", feature = "uring"))]
        BackendKind::Uring => Ok(Box::new(super::UringIo::new(queue_depth)?)),

        #[cfg(all(target_os = "linux", feature = "aio"))]
        BackendKind::Aio => Ok(Box::new(super::AioIo::new(queue_depth)?)),

        #[allow(unreachable_patterns)]
        other => {
            let _ = queue_depth;
            Err(OffloadError::UnsupportedBackend(other.name().to_string()))
        }
    }
}
