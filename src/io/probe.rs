//! Backend capability queries
//!
//! `get_backends` lists what was compiled in; `probe_backend` checks that a
//! backend actually works on this host by round-tripping a few records
//! through an anonymous temp file.

use std::os::unix::io::AsRawFd;
use std::sync::OnceLock;

use crate::error::{OffloadError, Result};

use super::backend::{self, AsyncIo, BackendKind};
use super::{BufferHandle, Direction, Request, WaitMode};

/// Records written and read back by the self-test
const PROBE_RECORDS: usize = 5;

/// Size of each self-test record
const PROBE_RECORD_LEN: usize = 18;

/// Depth of the throwaway backend used for probing
const PROBE_DEPTH: usize = 2;

/// Backends compiled into this build, in preference order
pub fn get_backends() -> Vec<BackendKind> {
    #[allow(unused_mut)]
    let mut backends = Vec::new();
    #[cfg(all(target_os = "linux", feature = "uring"))]
    backends.push(BackendKind::Uring);
    #[cfg(all(target_os = "linux", feature = "aio"))]
    backends.push(BackendKind::Aio);
    backends
}

/// Whether the named backend is compiled in and usable on this host
///
/// Unknown names and backends missing from `get_backends` report `false`.
pub fn probe_backend(name: &str) -> bool {
    match name.parse::<BackendKind>() {
        Ok(kind) => get_backends().contains(&kind) && probe_cached(kind).is_ok(),
        Err(_) => false,
    }
}

/// Probe once per process; the reason is kept for error messages
pub(crate) fn probe_cached(kind: BackendKind) -> std::result::Result<(), String> {
    static URING: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    static AIO: OnceLock<std::result::Result<(), String>> = OnceLock::new();

    let cell = match kind {
        BackendKind::Uring => &URING,
        BackendKind::Aio => &AIO,
    };

    cell.get_or_init(|| {
        let outcome = backend::create(kind, PROBE_DEPTH).and_then(|mut io| self_test(io.as_mut()));
        match &outcome {
            Ok(()) => tracing::debug!(backend = %kind, "backend probe succeeded"),
            Err(e) => tracing::debug!(backend = %kind, error = %e, "backend probe failed"),
        }
        outcome.map_err(|e| e.to_string())
    })
    .clone()
}

/// Write a few records, read them back and compare
fn self_test(io: &mut dyn AsyncIo) -> Result<()> {
    let file = tempfile::tempfile()?;
    let fd = file.as_raw_fd();

    let mut written = [[0u8; PROBE_RECORD_LEN]; PROBE_RECORDS];
    for (i, record) in written.iter_mut().enumerate() {
        for (j, byte) in record.iter_mut().enumerate() {
            *byte = (i * PROBE_RECORD_LEN + j) as u8;
        }
    }
    let mut read_back = [[0u8; PROBE_RECORD_LEN]; PROBE_RECORDS];

    for (i, record) in written.iter().enumerate() {
        let offset = (i * PROBE_RECORD_LEN) as u64;
        let request = Request::write(fd, vec![BufferHandle::from(&record[..])], offset);
        // `written` outlives the write barrier below.
        unsafe { io.submit(request)? };
    }
    io.reap(WaitMode::Direction(Direction::Write))?;

    for (i, record) in read_back.iter_mut().enumerate() {
        let offset = (i * PROBE_RECORD_LEN) as u64;
        let request = Request::read(fd, vec![BufferHandle::from(&mut record[..])], offset);
        // `read_back` outlives the read barrier below.
        unsafe { io.submit(request)? };
    }
    io.reap(WaitMode::Direction(Direction::Read))?;
    io.close()?;

    if written != read_back {
        return Err(OffloadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "read-back data differs from written data",
        )));
    }
    Ok(())
}
