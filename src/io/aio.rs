//! Classic async backend (Linux kernel AIO)
//!
//! A fixed-size AIO context of `queue_depth` control blocks. Every buffer
//! of a vectorized Request is its own native op; the Request completes
//! once all of them have been reaped.

use std::io;
use std::ptr;

use libc::{c_long, c_ulong};

use crate::error::{OffloadError, Result};

use super::backend::{AsyncIo, BackendKind};
use super::request::{self, NativeOp, NativeQueue, RequestTable};
use super::{Direction, Request, RequestId, WaitMode};

type AioContext = c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// `struct iocb` from `linux/aio_abi.h`
#[repr(C)]
#[derive(Default)]
struct IoCb {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event` from `linux/aio_abi.h`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// Kernel AIO implementation of `AsyncIo`
pub struct AioIo {
    /// Kernel AIO context
    ctx: AioContext,

    /// Max native ops in flight (context size)
    depth: usize,

    /// Native ops submitted and not yet reaped
    in_flight: usize,

    /// Logical Requests in flight
    table: RequestTable,

    /// Scratch space for io_getevents
    events: Vec<IoEvent>,

    closed: bool,
}

impl AioIo {
    /// Create an AIO context with room for `depth` native ops
    pub fn new(depth: usize) -> Result<Self> {
        let nr_events = c_long::try_from(depth)
            .map_err(|_| OffloadError::Config(format!("queue depth {} is too large", depth)))?;

        let mut ctx: AioContext = 0;
        let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr_events, &mut ctx as *mut AioContext) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        tracing::debug!(depth, "aio context ready");

        Ok(Self {
            ctx,
            depth,
            in_flight: 0,
            table: RequestTable::new(),
            events: vec![IoEvent::default(); depth],
            closed: false,
        })
    }

    /// Submit one control block, reaping first while the context is full
    fn push(&mut self, op: &NativeOp) -> Result<()> {
        while self.in_flight >= self.depth {
            self.drain(true)?;
        }

        let iov = self.table.iovecs(op.slot)[op.iov_start];
        let mut cb = IoCb {
            aio_data: op.slot as u64,
            aio_lio_opcode: match op.direction {
                Direction::Read => IOCB_CMD_PREAD,
                Direction::Write => IOCB_CMD_PWRITE,
            },
            aio_fildes: op.fd as u32,
            aio_buf: iov.iov_base as u64,
            aio_nbytes: op.len as u64,
            aio_offset: op.offset as i64,
            ..Default::default()
        };

        loop {
            // The kernel copies the control block during io_submit; only the
            // buffer has to outlive the call.
            let mut cbs = [&mut cb as *mut IoCb];
            let ret = unsafe { libc::syscall(libc::SYS_io_submit, self.ctx, 1 as c_long, cbs.as_mut_ptr()) };
            if ret == 1 {
                break;
            }

            let err = if ret < 0 {
                io::Error::last_os_error()
            } else {
                io::Error::from_raw_os_error(libc::EAGAIN)
            };
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) if self.in_flight > 0 => {
                    self.drain(true)?;
                }
                _ => return Err(err.into()),
            }
        }

        self.in_flight += 1;
        Ok(())
    }
}

impl NativeQueue for AioIo {
    fn table(&mut self) -> &mut RequestTable {
        &mut self.table
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn drain(&mut self, wait: bool) -> Result<usize> {
        if self.in_flight == 0 {
            return Ok(0);
        }
        let min_nr: c_long = if wait { 1 } else { 0 };

        let n = loop {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min_nr,
                    self.events.len() as c_long,
                    self.events.as_mut_ptr(),
                    ptr::null_mut::<libc::timespec>(),
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err.into());
            }
        };

        for i in 0..n {
            let event = self.events[i];
            self.in_flight -= 1;
            self.table.complete_op(event.data as usize, event.res);
        }
        Ok(n)
    }
}

impl AsyncIo for AioIo {
    fn kind(&self) -> BackendKind {
        BackendKind::Aio
    }

    fn queue_depth(&self) -> usize {
        self.depth
    }

    unsafe fn submit(&mut self, request: Request) -> Result<RequestId> {
        let (slot, id) = self.table.insert(request);

        for op in self.table.plan(slot, false) {
            match self.push(&op) {
                Ok(()) => self.table.op_pushed(slot),
                Err(e) => {
                    self.table.op_rejected(slot, e);
                    break;
                }
            }
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

/// Drain in-flight ops, then destroy the context.
impl Drop for AioIo {
    fn drop(&mut self) {
        while self.in_flight > 0 {
            if let Err(e) = self.drain(true) {
                tracing::warn!(error = %e, in_flight = self.in_flight, "aio drain on drop failed");
                break;
            }
        }
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "io_destroy failed");
        }
    }
}
