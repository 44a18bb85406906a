//! Writer Module
//!
//! Append-only writes into one file through a backend.
//!
//! ## Responsibilities
//! - Assign each payload its byte range at call time (monotonic cursor)
//! - Keep every payload alive until its write completes
//! - Stage device-resident payloads through pinned host memory on a
//!   dedicated copy stream
//!
//! ## Append Flow
//! ```text
//!  append(bytes) ──────────────────────────────┐
//!                                              ▼
//!  append_device(buf) ─▶ copy stream ─▶ ┌──────────────┐   completion
//!   (cursor assigned     (offload-copy  │   AsyncIo    │──▶ keep-alive
//!    immediately)         thread)       │   submit     │    slot released
//!                                       └──────────────┘
//! ```
//!
//! A byte range is only valid to read after `synchronize()` has returned.

mod keepalive;
mod sequential;
mod staging;

pub use keepalive::Owner;
pub use sequential::SequentialWriter;
