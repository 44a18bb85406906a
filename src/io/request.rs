//! Requests and the in-flight request table
//!
//! Both backends share this bookkeeping; they differ only in how a
//! Request is turned into native ops and how completions are collected.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use slab::Slab;

use crate::error::{OffloadError, Result};

use super::{BufferHandle, Direction, WaitMode};

/// User notification fired once a Request completed successfully
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Internal completion hook: receives the Request's outcome and returns
/// the outcome to report (it may swallow or replace an error)
pub type CompletionHook = Box<dyn FnOnce(Result<()>) -> Result<()> + Send + 'static>;

/// Largest byte count handed to a single native op
///
/// Linux caps one read/write at `MAX_RW_COUNT` (just below 2 GiB); larger
/// buffers are split so a Request never ends in a silent short transfer.
pub(crate) const MAX_OP_BYTES: usize = 1 << 30;

/// Largest iovec count per native op (`UIO_MAXIOV`)
pub(crate) const MAX_IOVECS: usize = 1024;

/// Identity of a submitted Request (monotonic, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Request
// =============================================================================

/// One logical transfer: 1..n buffers at consecutive file offsets
pub struct Request {
    pub(crate) direction: Direction,
    pub(crate) fd: RawFd,
    pub(crate) buffers: Vec<BufferHandle>,
    pub(crate) offset: u64,
    pub(crate) hook: Option<CompletionHook>,
    pub(crate) blocking: bool,
    pub(crate) key: Option<Arc<str>>,
}

impl Request {
    pub fn new(direction: Direction, fd: RawFd, buffers: Vec<BufferHandle>, offset: u64) -> Self {
        Self {
            direction,
            fd,
            buffers,
            offset,
            hook: None,
            blocking: false,
            key: None,
        }
    }

    pub fn read(fd: RawFd, buffers: Vec<BufferHandle>, offset: u64) -> Self {
        Self::new(Direction::Read, fd, buffers, offset)
    }

    pub fn write(fd: RawFd, buffers: Vec<BufferHandle>, offset: u64) -> Self {
        Self::new(Direction::Write, fd, buffers, offset)
    }

    /// Run `hook` with the outcome once every native op has finished
    pub fn on_complete(mut self, hook: CompletionHook) -> Self {
        self.hook = Some(match self.hook.take() {
            Some(prev) => Box::new(move |outcome| hook(prev(outcome))),
            None => hook,
        });
        self
    }

    /// Fire `callback` after a successful completion (after any hook)
    pub fn with_callback(self, callback: Callback) -> Self {
        self.on_complete(Box::new(move |outcome| {
            if outcome.is_ok() {
                callback();
            }
            outcome
        }))
    }

    /// Report this Request's outcome through `wait_for` instead of `reap`
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Attach a key for diagnostics
    pub fn key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total bytes across all buffers
    pub fn len(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Native Op Planning
// =============================================================================

/// One native op: a run of iovecs at one file offset
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeOp {
    pub slot: usize,
    pub direction: Direction,
    pub fd: RawFd,
    pub offset: u64,
    pub iov_start: usize,
    pub iov_count: usize,
    pub len: usize,
}

/// State of a submitted Request
struct InFlight {
    id: RequestId,
    direction: Direction,
    fd: RawFd,
    offset: u64,
    blocking: bool,
    key: Option<Arc<str>>,
    hook: Option<CompletionHook>,
    /// Heap storage the kernel reads for vectored ops; never reallocated
    iovecs: Vec<libc::iovec>,
    expected: u64,
    transferred: u64,
    pending_ops: usize,
    /// All native ops have been handed over (or submission stopped)
    sealed: bool,
    /// Nobody waits for this blocking Request any more
    abandoned: bool,
    error: Option<OffloadError>,
}

// iovecs point at caller memory whose exclusivity the submitter guarantees.
unsafe impl Send for InFlight {}

// =============================================================================
// Request Table
// =============================================================================

/// Arena of in-flight Requests indexed by native user data
///
/// ## Accounting:
/// - `outstanding`: logical Requests per direction (reads, writes), each
///   drained by its own barrier
/// - `blocking_outcomes`: results of blocking Requests until `wait_for`
/// - `deferred`: first failure of a non-blocking Request
pub(crate) struct RequestTable {
    slots: Slab<InFlight>,
    next_id: u64,
    outstanding: [usize; 2],
    blocking_outcomes: HashMap<RequestId, Result<()>>,
    deferred: Option<OffloadError>,
    suppressed: usize,
    completed: u64,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_id: 0,
            outstanding: [0, 0],
            blocking_outcomes: HashMap::new(),
            deferred: None,
            suppressed: 0,
            completed: 0,
        }
    }

    /// Register a Request; returns its slot (native user data) and id
    pub fn insert(&mut self, request: Request) -> (usize, RequestId) {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let mut iovecs = Vec::with_capacity(request.buffers.len());
        for buf in &request.buffers {
            let mut base = buf.as_ptr();
            let mut remaining = buf.len();
            while remaining > 0 {
                let n = remaining.min(MAX_OP_BYTES);
                iovecs.push(libc::iovec {
                    iov_base: base.cast(),
                    iov_len: n,
                });
                base = base.wrapping_add(n);
                remaining -= n;
            }
        }

        let expected = request.len();
        let direction = request.direction;
        let slot = self.slots.insert(InFlight {
            id,
            direction,
            fd: request.fd,
            offset: request.offset,
            blocking: request.blocking,
            key: request.key,
            hook: request.hook,
            iovecs,
            expected,
            transferred: 0,
            pending_ops: 0,
            sealed: false,
            abandoned: false,
            error: None,
        });
        self.outstanding[direction.index()] += 1;

        tracing::trace!(request = id.0, ?direction, bytes = expected, "request submitted");
        (slot, id)
    }

    /// Split a Request into native ops
    ///
    /// With `vectored`, consecutive iovecs are grouped into one op (bounded
    /// by `MAX_IOVECS` and `MAX_OP_BYTES`); otherwise each iovec is its own op.
    pub fn plan(&self, slot: usize, vectored: bool) -> Vec<NativeOp> {
        let entry = &self.slots[slot];
        let iovecs = &entry.iovecs;
        let mut ops = Vec::new();
        let mut offset = entry.offset;
        let mut i = 0;

        while i < iovecs.len() {
            let start = i;
            let mut len = 0usize;
            loop {
                len += iovecs[i].iov_len;
                i += 1;
                if !vectored
                    || i == iovecs.len()
                    || i - start == MAX_IOVECS
                    || len + iovecs[i].iov_len > MAX_OP_BYTES
                {
                    break;
                }
            }
            ops.push(NativeOp {
                slot,
                direction: entry.direction,
                fd: entry.fd,
                offset,
                iov_start: start,
                iov_count: i - start,
                len,
            });
            offset += len as u64;
        }
        ops
    }

    /// The Request's iovecs (stable until the Request finishes)
    pub fn iovecs(&self, slot: usize) -> &[libc::iovec] {
        &self.slots[slot].iovecs
    }

    /// A native op of this Request is now owned by the kernel
    pub fn op_pushed(&mut self, slot: usize) {
        self.slots[slot].pending_ops += 1;
    }

    /// A native op could not be handed over; the Request will fail
    pub fn op_rejected(&mut self, slot: usize, error: OffloadError) {
        let entry = &mut self.slots[slot];
        if entry.error.is_none() {
            entry.error = Some(error);
        }
    }

    /// No more native ops will be pushed for this Request
    pub fn seal(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        entry.sealed = true;
        if entry.pending_ops == 0 {
            self.finish(slot);
        }
    }

    /// Apply one native completion (`result` = bytes moved or -errno)
    pub fn complete_op(&mut self, slot: usize, result: i64) {
        let Some(entry) = self.slots.get_mut(slot) else {
            tracing::warn!(slot, "completion for unknown request slot");
            return;
        };

        entry.pending_ops -= 1;
        if result < 0 {
            if entry.error.is_none() {
                let errno = (-result) as i32;
                entry.error = Some(OffloadError::Io(std::io::Error::from_raw_os_error(errno)));
            }
        } else {
            entry.transferred += result as u64;
        }

        if entry.sealed && entry.pending_ops == 0 {
            self.finish(slot);
        }
    }

    /// Outstanding Requests of one direction (or both)
    pub fn outstanding(&self, direction: Option<Direction>) -> usize {
        match direction {
            Some(d) => self.outstanding[d.index()],
            None => self.outstanding.iter().sum(),
        }
    }

    /// Total Requests completed so far
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Outcome of a finished blocking Request
    pub fn take_outcome(&mut self, id: RequestId) -> Option<Result<()>> {
        self.blocking_outcomes.remove(&id)
    }

    /// Whether a Request with this id has not finished yet
    pub fn is_in_flight(&self, id: RequestId) -> bool {
        self.slots.iter().any(|(_, entry)| entry.id == id)
    }

    /// Drop the outcome of a blocking Request instead of keeping it for `wait_for`
    pub fn abandon(&mut self, id: RequestId) {
        if self.blocking_outcomes.remove(&id).is_some() {
            return;
        }
        if let Some((_, entry)) = self.slots.iter_mut().find(|(_, entry)| entry.id == id) {
            entry.abandoned = true;
        }
    }

    /// Return (and clear) the first recorded async failure
    pub fn take_deferred(&mut self) -> Result<()> {
        match self.deferred.take() {
            Some(error) => {
                if self.suppressed > 0 {
                    tracing::warn!(
                        suppressed = self.suppressed,
                        "additional async I/O failures were superseded by the first one"
                    );
                    self.suppressed = 0;
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn finish(&mut self, slot: usize) {
        let entry = self.slots.remove(slot);
        self.outstanding[entry.direction.index()] -= 1;
        self.completed += 1;

        let outcome = match entry.error {
            Some(error) => Err(error),
            None if entry.transferred != entry.expected => Err(OffloadError::ShortTransfer {
                expected: entry.expected,
                actual: entry.transferred,
            }),
            None => Ok(()),
        };

        tracing::trace!(
            request = entry.id.0,
            key = entry.key.as_deref().unwrap_or(""),
            ok = outcome.is_ok(),
            "request completed"
        );

        let outcome = match entry.hook {
            Some(hook) => hook(outcome),
            None => outcome,
        };

        if entry.abandoned {
            tracing::debug!(request = entry.id.0, ok = outcome.is_ok(), "abandoned request finished");
        } else if entry.blocking {
            self.blocking_outcomes.insert(entry.id, outcome);
        } else if let Err(error) = outcome {
            self.defer(error);
        }
    }

    fn defer(&mut self, error: OffloadError) {
        if self.deferred.is_none() {
            tracing::debug!(%error, "recording async I/O failure");
            self.deferred = Some(error);
        } else {
            tracing::warn!(%error, "async I/O failure while an earlier one is pending");
            self.suppressed += 1;
        }
    }
}

// =============================================================================
// Shared Completion Driving
// =============================================================================

/// Native side of a backend, as seen by the shared wait loops
pub(crate) trait NativeQueue {
    fn table(&mut self) -> &mut RequestTable;

    /// Native ops handed to the kernel (or queued for it) and not yet reaped
    fn in_flight(&self) -> usize;

    /// Collect completions; with `wait`, block for at least one
    fn drain(&mut self, wait: bool) -> Result<usize>;
}

/// `AsyncIo::reap` in terms of a native queue
pub(crate) fn reap<Q: NativeQueue + ?Sized>(queue: &mut Q, mode: WaitMode) -> Result<usize> {
    let before = queue.table().completed();

    let driven = match mode {
        WaitMode::NoWait => queue.drain(false).map(|_| ()),
        WaitMode::Direction(d) => wait_until(queue, |t| t.outstanding(Some(d)) == 0),
        WaitMode::All => wait_until(queue, |t| t.outstanding(None) == 0),
    };

    let reaped = (queue.table().completed() - before) as usize;
    driven?;
    queue.table().take_deferred()?;
    Ok(reaped)
}

/// `AsyncIo::wait_for` in terms of a native queue
pub(crate) fn wait_for<Q: NativeQueue + ?Sized>(queue: &mut Q, id: RequestId) -> Result<()> {
    loop {
        if let Some(outcome) = queue.table().take_outcome(id) {
            return outcome;
        }
        if queue.in_flight() == 0 {
            return Err(stalled(format!("request {} is not in flight", id.0)));
        }
        queue.drain(true)?;
    }
}

fn wait_until<Q, F>(queue: &mut Q, mut done: F) -> Result<()>
where
    Q: NativeQueue + ?Sized,
    F: FnMut(&mut RequestTable) -> bool,
{
    while !done(queue.table()) {
        if queue.in_flight() == 0 {
            return Err(stalled("outstanding requests without native ops".to_string()));
        }
        queue.drain(true)?;
    }
    Ok(())
}

fn stalled(msg: String) -> OffloadError {
    OffloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
}
