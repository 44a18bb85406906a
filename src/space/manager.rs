//! Space Manager
//!
//! Allocates and frees byte ranges inside the backing file.
//!
//! ## Allocation Policy
//! 1. Best fit: the smallest free Region that can hold the request
//!    (lowest offset on ties), split from the front
//! 2. A free Region touching the end of the used area is grown in place
//! 3. Otherwise the used area is extended at its end
//!
//! The used area never shrinks; freed tail space stays on the free list.

use std::collections::BTreeMap;

use crate::error::{OffloadError, Result};

use super::Region;

/// Free-list allocator for the backing file
///
/// ## Concurrency:
/// - Not internally synchronized; every method is short and I/O free
/// - Owners keep it behind one lock together with their key table
#[derive(Debug, Default)]
pub struct SpaceManager {
    /// Maximum end offset (0 = unlimited)
    limit: u64,

    /// End of the used area (high-water mark)
    end: u64,

    /// Free Regions keyed by offset (offset → length), never adjacent
    free_list: BTreeMap<u64, u64>,
}

impl SpaceManager {
    /// Create an empty manager with an optional size limit (0 = unlimited)
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            end: 0,
            free_list: BTreeMap::new(),
        }
    }

    /// Allocate a Region of `size` bytes
    pub fn allocate(&mut self, size: u64) -> Result<Region> {
        if size == 0 {
            return Err(OffloadError::InvalidSize("cannot allocate 0 bytes".to_string()));
        }

        // Step 1: Best fit among free Regions
        let best = self
            .free_list
            .iter()
            .filter(|(_, &len)| len >= size)
            .min_by_key(|(&offset, &len)| (len, offset))
            .map(|(&offset, &len)| (offset, len));

        if let Some((offset, len)) = best {
            self.free_list.remove(&offset);
            if len > size {
                self.free_list.insert(offset + size, len - size);
            }
            return Ok(Region::new(offset, size));
        }

        // Step 2: Grow a free tail Region in place
        let tail = self
            .free_list
            .iter()
            .next_back()
            .filter(|(&offset, &len)| offset + len == self.end)
            .map(|(&offset, &len)| (offset, len));

        if let Some((offset, len)) = tail {
            let new_end = self.checked_end(offset, size)?;
            self.free_list.remove(&offset);
            debug_assert!(len < size);
            self.end = new_end;
            return Ok(Region::new(offset, size));
        }

        // Step 3: Extend the used area
        let offset = self.end;
        self.end = self.checked_end(offset, size)?;
        Ok(Region::new(offset, size))
    }

    /// Return a Region to the free list, coalescing with adjacent neighbours
    ///
    /// Freeing a Region that is already free (or overlaps a free one) is a
    /// caller bug; it is only checked in debug builds.
    pub fn free(&mut self, region: Region) -> Result<()> {
        if region.length == 0 {
            return Err(OffloadError::InvalidSize("cannot free 0 bytes".to_string()));
        }
        debug_assert!(region.end() <= self.end, "freeing beyond the used area");
        debug_assert!(
            !self.free_regions().iter().any(|r| r.overlaps(&region)),
            "double free of {:?}",
            region
        );

        let mut merged = region;

        // Merge with the free Region immediately before
        if let Some((&prev_offset, &prev_len)) = self.free_list.range(..region.offset).next_back() {
            let prev = Region::new(prev_offset, prev_len);
            if prev.precedes(&region) {
                self.free_list.remove(&prev_offset);
                merged = Region::new(prev_offset, prev_len + merged.length);
            }
        }

        // Merge with the free Region immediately after
        if let Some(&next_len) = self.free_list.get(&region.end()) {
            self.free_list.remove(&region.end());
            merged.length += next_len;
        }

        self.free_list.insert(merged.offset, merged.length);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// End of the used area (the backing file never needs to be larger)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Configured limit (0 = unlimited)
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Total bytes on the free list
    pub fn free_bytes(&self) -> u64 {
        self.free_list.values().sum()
    }

    /// Bytes currently handed out
    pub fn allocated_bytes(&self) -> u64 {
        self.end - self.free_bytes()
    }

    /// Free Regions in offset order
    pub fn free_regions(&self) -> Vec<Region> {
        self.free_list
            .iter()
            .map(|(&offset, &length)| Region::new(offset, length))
            .collect()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn checked_end(&self, offset: u64, size: u64) -> Result<u64> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| OffloadError::InvalidSize(format!("{} bytes overflows the file", size)))?;
        if self.limit > 0 && end > self.limit {
            return Err(OffloadError::SpaceExhausted {
                requested: size,
                limit: self.limit,
            });
        }
        Ok(end.max(self.end))
    }
}
