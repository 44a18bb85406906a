//! Space Module
//!
//! Byte-range bookkeeping for the backing file.
//!
//! ## Responsibilities
//! - Hand out Regions for new writes (best fit, then file end)
//! - Take Regions back and coalesce them with free neighbours
//! - Never perform I/O; callers serialize access under their own lock
//!
//! ## Layout
//! ```text
//! offset 0                                                  end
//! ┌──────────┬────────┬──────────────┬───────┬───────────────┐
//! │ key "a"  │  free  │   key "b"    │ free  │    key "c"    │
//! └──────────┴────────┴──────────────┴───────┴───────────────┘
//!             ▲ reused by the smallest request that fits
//! ```

mod manager;
mod region;

pub use manager::SpaceManager;
pub use region::Region;
