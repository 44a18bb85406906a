//! Store Module
//!
//! Keyed random-access offload on top of the space manager and a backend.
//!
//! ## Responsibilities
//! - Map keys (single buffers or ordered groups) to Regions
//! - Submit sync/async, single/vectorized reads and writes
//! - Expose the per-direction barriers and the global `synchronize`
//!
//! ## Data Flow
//! ```text
//!   write(key, bufs)                     read(key, bufs)
//!        │                                    │
//!        ▼                                    ▼
//!  ┌───────────────┐  allocate      ┌────────────────┐ resolve
//!  │ SpaceManager  │◀───────────────│    KeyTable    │◀────────
//!  └───────┬───────┘                └────────┬───────┘
//!          │ Region                          │ Region + lengths
//!          └────────────────┬────────────────┘
//!                           ▼
//!                   ┌───────────────┐   hook: commit / abort,
//!                   │    AsyncIo    │── free superseded Region
//!                   └───────────────┘
//! ```

mod keys;
mod offload_store;

pub use keys::{KeyTable, Layout};
pub use offload_store::OffloadStore;
