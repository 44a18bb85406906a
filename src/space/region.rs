//! Region definition
//!
//! A contiguous byte range in the backing file.

/// A byte range `[offset, offset + length)` in the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// First byte of the range
    pub offset: u64,

    /// Number of bytes in the range
    pub length: u64,
}

impl Region {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of the range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Whether `other` starts exactly where this region ends
    pub fn precedes(&self, other: &Region) -> bool {
        self.end() == other.offset
    }

    /// Whether the two ranges share at least one byte
    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}
