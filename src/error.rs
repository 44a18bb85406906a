//! Error types for nvme-offload
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using OffloadError
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Unified error type for offload operations
#[derive(Debug, Error)]
pub enum OffloadError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Backend \"{backend}\" is not usable on this host: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Layout mismatch for key {key}: written as {expected:?}, read as {actual:?}")]
    LayoutMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Buffer storage has been released")]
    EmptyStorage,

    #[error("Buffer {id} has a transfer in flight")]
    BufferBusy { id: u64 },

    // -------------------------------------------------------------------------
    // Space Errors
    // -------------------------------------------------------------------------
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("File size exceeds limit: requested {requested} bytes with limit {limit}")]
    SpaceExhausted { requested: u64, limit: u64 },

    // -------------------------------------------------------------------------
    // Staging Errors
    // -------------------------------------------------------------------------
    #[error("Staging error: {0}")]
    Staging(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OffloadError {
    /// Whether this error came from backend selection at construction time
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OffloadError::UnsupportedBackend(_)
                | OffloadError::BackendUnavailable { .. }
                | OffloadError::Config(_)
        )
    }
}
