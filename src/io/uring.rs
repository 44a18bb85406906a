//! Completion-queue backend (io_uring)
//!
//! One ring of `queue_depth` entries. Vectorized Requests become native
//! readv/writev ops when the kernel advertises them, otherwise one
//! read/write op per buffer aggregated under the same Request.

use io_uring::{opcode, squeue, types, IoUring, Probe};

use crate::error::{OffloadError, Result};

use super::backend::{AsyncIo, BackendKind};
use super::request::{self, NativeOp, NativeQueue, RequestTable};
use super::{Direction, Request, RequestId, WaitMode};

/// io_uring implementation of `AsyncIo`
pub struct UringIo {
    /// Submission/completion ring
    ring: IoUring,

    /// Max native ops in flight
    depth: usize,

    /// Kernel supports IORING_OP_READV / IORING_OP_WRITEV
    vectored: bool,

    /// Native ops pushed and not yet reaped
    in_flight: usize,

    /// Logical Requests in flight
    table: RequestTable,

    closed: bool,
}

impl UringIo {
    /// Set up a ring with room for `depth` native ops
    pub fn new(depth: usize) -> Result<Self> {
        let entries = u32::try_from(depth)
            .map_err(|_| OffloadError::Config(format!("queue depth {} is too large", depth)))?;
        let ring = IoUring::new(entries)?;

        // Kernels without IORING_REGISTER_PROBE predate the plain read/write
        // opcodes, so the vectored ones are the safe assumption.
        let mut probe = Probe::new();
        let vectored = match ring.submitter().register_probe(&mut probe) {
            Ok(()) => probe.is_supported(opcode::Readv::CODE) && probe.is_supported(opcode::Writev::CODE),
            Err(_) => true,
        };

        tracing::debug!(depth, vectored, "io_uring ring ready");

        Ok(Self {
            ring,
            depth,
            vectored,
            in_flight: 0,
            table: RequestTable::new(),
            closed: false,
        })
    }

    /// Build the submission entry for one native op
    fn entry(&self, op: &NativeOp) -> squeue::Entry {
        let fd = types::Fd(op.fd);
        let iovecs = &self.table.iovecs(op.slot)[op.iov_start..op.iov_start + op.iov_count];

        let entry = if self.vectored {
            let ptr = iovecs.as_ptr();
            let count = op.iov_count as u32;
            match op.direction {
                Direction::Read => opcode::Readv::new(fd, ptr, count).offset(op.offset).build(),
                Direction::Write => opcode::Writev::new(fd, ptr, count).offset(op.offset).build(),
            }
        } else {
            let iov = iovecs[0];
            let len = iov.iov_len as u32;
            match op.direction {
                Direction::Read => opcode::Read::new(fd, iov.iov_base.cast(), len)
                    .offset(op.offset)
                    .build(),
                Direction::Write => opcode::Write::new(fd, iov.iov_base.cast::<u8>() as *const u8, len)
                    .offset(op.offset)
                    .build(),
            }
        };

        entry.user_data(op.slot as u64)
    }

    /// Queue one entry, reaping first while the ring is at depth
    fn push(&mut self, entry: squeue::Entry) -> Result<()> {
        while self.in_flight >= self.depth {
            self.drain(true)?;
        }

        loop {
            // The entry's iovec pointers live in the request table until the
            // op completes.
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if pushed {
                break;
            }
            self.submit_pending()?;
        }

        self.in_flight += 1;
        Ok(())
    }

    /// Hand queued entries to the kernel
    fn submit_pending(&mut self) -> Result<()> {
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    // Completion queue is full; make room and retry
                    self.collect();
                }
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move every available completion into the request table
    fn collect(&mut self) -> usize {
        let completions: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for &(user_data, result) in &completions {
            self.in_flight -= 1;
            self.table.complete_op(user_data as usize, result as i64);
        }
        completions.len()
    }
}

impl NativeQueue for UringIo {
    fn table(&mut self) -> &mut RequestTable {
        &mut self.table
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn drain(&mut self, wait: bool) -> Result<usize> {
        if wait && self.in_flight > 0 {
            loop {
                match self.ring.submit_and_wait(1) {
                    Ok(_) => break,
                    Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    // CQ overflow: completions are already waiting
                    Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(self.collect())
    }
}

impl AsyncIo for UringIo {
    fn kind(&self) -> BackendKind {
        BackendKind::Uring
    }

    fn queue_depth(&self) -> usize {
        self.depth
    }

    unsafe fn submit(&mut self, request: Request) -> Result<RequestId> {
        let (slot, id) = self.table.insert(request);

        for op in self.table.plan(slot, self.vectored) {
            let entry = self.entry(&op);
            match self.push(entry) {
                Ok(()) => self.table.op_pushed(slot),
                Err(e) => {
                    self.table.op_rejected(slot, e);
                    break;
                }
            }
        }

        if let Err(e) = self.submit_pending() {
            // Entries stay queued; the next wait submits them again.
            tracing::warn!(error = %e, "io_uring submit failed, retrying on next wait");
        }

        self.table.seal(slot);
        Ok(id)
    }

    fn reap(&mut self, mode: WaitMode) -> Result<usize> {
        request::reap(self, mode)
    }

    fn wait_for(&mut self, id: RequestId) -> Result<()> {
        request::wait_for(self, id)
    }

    fn is_in_flight(&self, id: RequestId) -> bool {
        self.table.is_in_flight(id)
    }

    fn abandon(&mut self, id: RequestId) {
        self.table.abandon(id);
    }

    fn outstanding(&self, direction: Option<Direction>) -> usize {
        self.table.outstanding(direction)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let drained = self.reap(WaitMode::All);
        self.closed = true;
        drained.map(|_| ())
    }
}

/// Drain in-flight ops so the kernel never writes into released memory.
impl Drop for UringIo {
    fn drop(&mut self) {
        while self.in_flight > 0 {
            if let Err(e) = self.drain(true) {
                tracing::warn!(error = %e, in_flight = self.in_flight, "io_uring drain on drop failed");
                break;
            }
        }
    }
}
