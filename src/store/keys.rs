//! Key table
//!
//! Maps each key to the layout of its last good write plus the layouts of
//! writes still in flight, and tracks which Regions reads are still using.
//!
//! ## Rewrite Sequence
//! ```text
//!  begin_write(k) ─▶ pending[seq] = new layout        (old layout kept)
//!        │
//!        ├─ write ok ──▶ commit(k, seq)  ─▶ old Region released
//!        └─ write err ─▶ abort(k, seq)   ─▶ new Region released
//!
//!  released Region ──no reads in flight──▶ returned for freeing
//!                  └─reads in flight─────▶ retired until end_read of the last one
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::space::Region;

/// Where a key's bytes live and how they were split into buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Region holding every buffer back to back
    pub region: Region,

    /// Length of each buffer, in write order
    pub lengths: Vec<usize>,
}

#[derive(Debug, Default)]
struct KeyEntry {
    /// Newest successfully written layout and its sequence number
    committed: Option<(u64, Layout)>,

    /// Writes submitted and not yet completed, by sequence number
    pending: BTreeMap<u64, Layout>,
}

impl KeyEntry {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.pending.is_empty()
    }
}

/// Key → layout catalog
#[derive(Debug, Default)]
pub struct KeyTable {
    entries: HashMap<String, KeyEntry>,
    next_seq: u64,

    /// Reads in flight per Region
    readers: HashMap<Region, usize>,

    /// Regions no key refers to that still have reads in flight
    retired: HashSet<Region>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write that has been assigned `layout`; returns its sequence
    pub fn begin_write(&mut self, key: &str, layout: Layout) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .entry(key.to_string())
            .or_default()
            .pending
            .insert(seq, layout);
        seq
    }

    /// The write `seq` completed; returns Regions that can be freed now
    ///
    /// The previously committed layout is superseded. A write that finishes
    /// after a newer one has already been committed is stale and its own
    /// Region is released instead.
    pub fn commit(&mut self, key: &str, seq: u64) -> Vec<Region> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        let Some(layout) = entry.pending.remove(&seq) else {
            return Vec::new();
        };

        let released = match &entry.committed {
            Some((committed_seq, _)) if *committed_seq > seq => vec![layout.region],
            _ => entry
                .committed
                .replace((seq, layout))
                .map(|(_, old)| vec![old.region])
                .unwrap_or_default(),
        };
        self.retire(released)
    }

    /// The write `seq` failed; the last good layout stays
    ///
    /// Returns the write's own Region unless a read still uses it.
    pub fn abort(&mut self, key: &str, seq: u64) -> Option<Region> {
        let entry = self.entries.get_mut(key)?;
        let layout = entry.pending.remove(&seq)?;
        if entry.is_empty() {
            self.entries.remove(key);
        }
        self.retire(vec![layout.region]).pop()
    }

    /// Layout a read of `key` should use: the newest submitted write
    pub fn resolve(&self, key: &str) -> Option<&Layout> {
        let entry = self.entries.get(key)?;
        entry
            .pending
            .values()
            .next_back()
            .or(entry.committed.as_ref().map(|(_, layout)| layout))
    }

    /// Resolve `key` for a read and hold its Region until `end_read`
    pub fn begin_read(&mut self, key: &str) -> Option<Layout> {
        let layout = self.resolve(key)?.clone();
        *self.readers.entry(layout.region).or_default() += 1;
        Some(layout)
    }

    /// A read of `region` finished; returns the Region if it can be freed now
    pub fn end_read(&mut self, region: Region) -> Option<Region> {
        let count = self.readers.get_mut(&region)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.readers.remove(&region);
        self.retired.remove(&region).then_some(region)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resolve(key).is_some()
    }

    /// Number of keys with a readable layout
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Released Regions waiting for reads to finish
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Split released Regions into those free now and those still being read
    fn retire(&mut self, released: Vec<Region>) -> Vec<Region> {
        let mut free = Vec::with_capacity(released.len());
        for region in released {
            if self.readers.contains_key(&region) {
                self.retired.insert(region);
            } else {
                free.push(region);
            }
        }
        free
    }
}
