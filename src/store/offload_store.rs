//! Offload Store
//!
//! Keyed random-access transfers into one backing file.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OffloadError, Result};
use crate::io::{self, AsyncIo, BackendKind, BufferHandle, Callback, CompletionHook, Direction, Request, WaitMode};
use crate::space::{Region, SpaceManager};

use super::keys::{KeyTable, Layout};

/// Space + key bookkeeping, guarded by one lock
#[derive(Debug)]
struct Catalog {
    space: SpaceManager,
    keys: KeyTable,
}

/// Keyed store of buffers in a backing file
///
/// ## Locking
/// - `io`: the backend; held for submission and while waiting
/// - `catalog`: space manager + key table; held only for bookkeeping
///
/// Completion hooks run under the `io` lock and take the `catalog` lock,
/// so the catalog lock is never held while acquiring `io`.
///
/// ## Lifecycle
/// - `open`: validate the backend, create the backing file
/// - writes allocate a Region; a rewritten key frees its old Region once
///   the new write has completed
/// - `close` (or drop): drain, release the backend, remove the file
pub struct OffloadStore {
    /// Backend; declared before `file` so it is dropped first
    io: Mutex<Box<dyn AsyncIo>>,

    catalog: Arc<Mutex<Catalog>>,

    /// Backing file (owns the descriptor handed to the kernel)
    file: File,

    /// Cached descriptor of `file`
    fd: RawFd,

    path: PathBuf,

    remove_on_close: bool,

    closed: bool,
}

impl OffloadStore {
    // =========================================================================
    // Internal Constants
    // =========================================================================
    const FILE_PREFIX: &'static str = "offload-";
    const MAX_NAME_ATTEMPTS: usize = 16;
    const WAIT_RETRIES: usize = 3;

    /// Open a store with the given config
    ///
    /// 1. Create the backend (fails fast if it is missing or unusable)
    /// 2. Create the data directory and an unused backing file
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Backend first so a bad selection leaves no file behind
        let backend = io::open_backend(config.backend, config.queue_depth)?;

        // Step 2: Backing file
        let (path, file) = Self::create_backing_file(&config)?;
        let fd = file.as_raw_fd();

        tracing::debug!(
            path = %path.display(),
            backend = %config.backend,
            queue_depth = config.queue_depth,
            "offload store opened"
        );

        Ok(Self {
            io: Mutex::new(backend),
            catalog: Arc::new(Mutex::new(Catalog {
                space: SpaceManager::new(config.file_size_limit),
                keys: KeyTable::new(),
            })),
            file,
            fd,
            path,
            remove_on_close: config.remove_on_close,
            closed: false,
        })
    }

    /// Open a store in `dir` with the default config otherwise
    pub fn open_in(dir: impl AsRef<Path>, queue_depth: usize, backend: BackendKind) -> Result<Self> {
        let config = Config::builder()
            .data_dir(dir.as_ref())
            .queue_depth(queue_depth)
            .backend(backend)
            .build();
        Self::open(config)
    }

    // =========================================================================
    // Synchronous Transfers
    // =========================================================================

    /// Write `buf` under `key` and wait for it
    pub fn sync_write(&self, key: &str, buf: &[u8]) -> Result<()> {
        self.sync_writev(key, &[buf])
    }

    /// Write `bufs` back to back under `key` and wait for it
    pub fn sync_writev(&self, key: &str, bufs: &[&[u8]]) -> Result<()> {
        let handles = bufs.iter().map(|b| BufferHandle::from(*b)).collect();
        // The borrow keeps every buffer alive and unmodified until the
        // blocking request has completed.
        unsafe { self.write_handles(key, handles, None, None, true) }
    }

    /// Read `key` into `buf` and wait for it
    pub fn sync_read(&self, key: &str, buf: &mut [u8]) -> Result<()> {
        self.sync_readv(key, &mut [buf])
    }

    /// Read `key` into `bufs` (same count and lengths as written)
    pub fn sync_readv(&self, key: &str, bufs: &mut [&mut [u8]]) -> Result<()> {
        let handles = bufs.iter_mut().map(|b| BufferHandle::from(&mut **b)).collect();
        // Exclusive borrows outlive the blocking request.
        unsafe { self.read_handles(key, handles, None, None, true) }
    }

    // =========================================================================
    // Asynchronous Transfers
    // =========================================================================

    /// Submit a write of `buf` under `key`; returns once it is queued
    ///
    /// # Safety
    /// The memory behind `buf` must stay valid and unmodified until the
    /// write completes (observed through a barrier or the callback).
    pub unsafe fn async_write(&self, key: &str, buf: BufferHandle, callback: Option<Callback>) -> Result<()> {
        self.write_handles(key, vec![buf], None, callback, false)
    }

    /// Vectorized `async_write`; the callback fires once all buffers are written
    ///
    /// # Safety
    /// See `async_write`.
    pub unsafe fn async_writev(&self, key: &str, bufs: Vec<BufferHandle>, callback: Option<Callback>) -> Result<()> {
        self.write_handles(key, bufs, None, callback, false)
    }

    /// Submit a read of `key` into `buf`; returns once it is queued
    ///
    /// # Safety
    /// The memory behind `buf` must stay valid and must not be accessed
    /// until the read completes.
    pub unsafe fn async_read(&self, key: &str, buf: BufferHandle, callback: Option<Callback>) -> Result<()> {
        self.read_handles(key, vec![buf], None, callback, false)
    }

    /// Vectorized `async_read`
    ///
    /// # Safety
    /// See `async_read`.
    pub unsafe fn async_readv(&self, key: &str, bufs: Vec<BufferHandle>, callback: Option<Callback>) -> Result<()> {
        self.read_handles(key, bufs, None, callback, false)
    }

    // =========================================================================
    // Barriers
    // =========================================================================

    /// Block until every outstanding write has completed
    pub fn sync_write_events(&self) -> Result<()> {
        self.io.lock().reap(WaitMode::Direction(Direction::Write)).map(|_| ())
    }

    /// Block until every outstanding read has completed
    pub fn sync_read_events(&self) -> Result<()> {
        self.io.lock().reap(WaitMode::Direction(Direction::Read)).map(|_| ())
    }

    /// Block until every outstanding request has completed
    pub fn synchronize(&self) -> Result<()> {
        self.io.lock().reap(WaitMode::All).map(|_| ())
    }

    /// Process completions that are already available; returns how many
    pub fn poll(&self) -> Result<usize> {
        self.io.lock().reap(WaitMode::NoWait)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> BackendKind {
        self.io.lock().kind()
    }

    pub fn queue_depth(&self) -> usize {
        self.io.lock().queue_depth()
    }

    /// Outstanding requests of one direction, or of both with `None`
    pub fn outstanding(&self, direction: Option<Direction>) -> usize {
        self.io.lock().outstanding(direction)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.catalog.lock().keys.contains(key)
    }

    /// Number of keys that can be read
    pub fn key_count(&self) -> usize {
        self.catalog.lock().keys.len()
    }

    /// Bytes of the backing file in use (free Regions included)
    pub fn space_end(&self) -> u64 {
        self.catalog.lock().space.end()
    }

    /// Bytes on the free list
    pub fn free_bytes(&self) -> u64 {
        self.catalog.lock().space.free_bytes()
    }

    /// Drain, release the backend and (if configured) remove the file
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    // =========================================================================
    // Request Construction
    // =========================================================================

    /// Allocate a Region for `key` and submit the write
    ///
    /// `hook` runs after the key table has been updated and before
    /// `callback`, whatever the outcome.
    ///
    /// # Safety
    /// Same contract as `AsyncIo::submit` for every handle.
    pub(crate) unsafe fn write_handles(
        &self,
        key: &str,
        bufs: Vec<BufferHandle>,
        hook: Option<CompletionHook>,
        callback: Option<Callback>,
        blocking: bool,
    ) -> Result<()> {
        let lengths: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
        let total: u64 = lengths.iter().map(|&len| len as u64).sum();

        let (region, seq) = {
            let mut catalog = self.catalog.lock();
            let region = catalog.space.allocate(total)?;
            let seq = catalog.keys.begin_write(key, Layout { region, lengths });
            (region, seq)
        };

        let key: Arc<str> = Arc::from(key);
        let hook_key = Arc::clone(&key);
        let catalog = Arc::clone(&self.catalog);

        let request = Request::write(self.fd, bufs, region.offset)
            .key(key)
            .on_complete(Box::new(move |outcome| {
                let mut catalog = catalog.lock();
                let Catalog { space, keys } = &mut *catalog;
                let released = match &outcome {
                    Ok(()) => keys.commit(&hook_key, seq),
                    Err(_) => keys.abort(&hook_key, seq).into_iter().collect(),
                };
                for region in released {
                    free_region(space, region);
                }
                outcome
            }));

        self.submit(request_with(request, hook, callback, blocking))
    }

    /// Resolve `key` and submit the read
    ///
    /// The resolved Region is leased until the read finishes, so a rewrite
    /// of `key` cannot hand it to another key in the meantime.
    ///
    /// # Safety
    /// Same contract as `AsyncIo::submit` for every handle.
    pub(crate) unsafe fn read_handles(
        &self,
        key: &str,
        bufs: Vec<BufferHandle>,
        hook: Option<CompletionHook>,
        callback: Option<Callback>,
        blocking: bool,
    ) -> Result<()> {
        let lengths: Vec<usize> = bufs.iter().map(|b| b.len()).collect();

        let lease = {
            let mut catalog = self.catalog.lock();
            let layout = catalog
                .keys
                .resolve(key)
                .ok_or_else(|| OffloadError::KeyNotFound(key.to_string()))?;
            if layout.lengths != lengths {
                return Err(OffloadError::LayoutMismatch {
                    key: key.to_string(),
                    expected: layout.lengths.clone(),
                    actual: lengths,
                });
            }
            let layout = catalog
                .keys
                .begin_read(key)
                .ok_or_else(|| OffloadError::KeyNotFound(key.to_string()))?;
            ReadLease {
                catalog: Arc::clone(&self.catalog),
                region: layout.region,
            }
        };

        let request = Request::read(self.fd, bufs, lease.region.offset)
            .key(key)
            .on_complete(Box::new(move |outcome| {
                drop(lease);
                outcome
            }));
        self.submit(request_with(request, hook, callback, blocking))
    }

    /// Submit under the backend lock; blocking requests are waited for
    ///
    /// A failed wait is retried while the Request is still in flight. If it
    /// is still running after that, it is abandoned: its outcome is dropped
    /// when it finishes, and memory borrowed by the caller may still be
    /// referenced by the kernel at that point.
    unsafe fn submit(&self, request: Request) -> Result<()> {
        let blocking = request.is_blocking();
        let mut io = self.io.lock();
        let id = io.submit(request)?;
        if !blocking {
            return Ok(());
        }

        let mut outcome = io.wait_for(id);
        let mut retries = 0;
        while outcome.is_err() && io.is_in_flight(id) && retries < Self::WAIT_RETRIES {
            if let Err(e) = &outcome {
                tracing::warn!(request = id.as_u64(), error = %e, "wait for blocking request failed, retrying");
            }
            outcome = io.wait_for(id);
            retries += 1;
        }

        if outcome.is_err() && io.is_in_flight(id) {
            io.abandon(id);
            tracing::error!(request = id.as_u64(), "blocking request abandoned while still in flight");
        }
        outcome
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn create_backing_file(config: &Config) -> Result<(PathBuf, File)> {
        if let Some(path) = &config.backing_file {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            return Ok((path.clone(), file));
        }

        fs::create_dir_all(&config.data_dir)?;
        for _ in 0..Self::MAX_NAME_ATTEMPTS {
            let name = format!("{}{}", Self::FILE_PREFIX, Uuid::new_v4().simple());
            let path = config.data_dir.join(name);
            match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OffloadError::Config(format!(
            "no unused backing file name in {}",
            config.data_dir.display()
        )))
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let drained = self.io.get_mut().close();

        // The file may still be referenced by the kernel until the backend
        // itself is gone; unlinking is fine, the descriptor stays open.
        let removed = if self.remove_on_close {
            fs::remove_file(&self.path).or_else(|e| match e.kind() {
                ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
        } else {
            self.file.sync_all()
        };

        tracing::debug!(path = %self.path.display(), ok = drained.is_ok(), "offload store closed");
        drained?;
        removed?;
        Ok(())
    }
}

/// A read's hold on its Region; dropping it ends the read
struct ReadLease {
    catalog: Arc<Mutex<Catalog>>,
    region: Region,
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        let mut catalog = self.catalog.lock();
        let Catalog { space, keys } = &mut *catalog;
        if let Some(region) = keys.end_read(self.region) {
            free_region(space, region);
        }
    }
}

fn free_region(space: &mut SpaceManager, region: Region) {
    if let Err(e) = space.free(region) {
        tracing::warn!(error = %e, ?region, "failed to free region");
    }
}

/// Attach the extra hook, the user callback and the blocking flag
fn request_with(
    mut request: Request,
    hook: Option<CompletionHook>,
    callback: Option<Callback>,
    blocking: bool,
) -> Request {
    if let Some(hook) = hook {
        request = request.on_complete(hook);
    }
    if let Some(callback) = callback {
        request = request.with_callback(callback);
    }
    if blocking {
        request = request.blocking();
    }
    request
}

impl Drop for OffloadStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, path = %self.path.display(), "offload store teardown failed");
        }
    }
}
