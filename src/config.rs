//! Configuration for nvme-offload
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::io::BackendKind;

/// Default number of native operations allowed in flight per backend
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Main configuration for an offload store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory receiving the backing file (created if absent)
    /// Internal structure:
    ///   {data_dir}/
    ///     └── offload-<uuid>   (backing file, one per store)
    pub data_dir: PathBuf,

    /// Exact backing file path; overrides the random name in `data_dir`
    pub backing_file: Option<PathBuf>,

    /// Upper bound on the backing file size in bytes (0 = unlimited)
    pub file_size_limit: u64,

    /// Remove the backing file when the store is closed or dropped
    pub remove_on_close: bool,

    // -------------------------------------------------------------------------
    // I/O Configuration
    // -------------------------------------------------------------------------
    /// Max native operations in flight; submissions beyond this block
    pub queue_depth: usize,

    /// Kernel async I/O facility used for transfers
    pub backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./offload_data"),
            backing_file: None,
            file_size_limit: 0,
            remove_on_close: true,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            backend: BackendKind::default_available(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the directory that receives the backing file
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Use an exact backing file path instead of a random name
    pub fn backing_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backing_file = Some(path.into());
        self
    }

    /// Set the backing file size limit (in bytes, 0 = unlimited)
    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.config.file_size_limit = bytes;
        self
    }

    /// Keep or remove the backing file on close
    pub fn remove_on_close(mut self, remove: bool) -> Self {
        self.config.remove_on_close = remove;
        self
    }

    /// Set the queue depth (max native operations in flight)
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    /// Select the async I/O backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
