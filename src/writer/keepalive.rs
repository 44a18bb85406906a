//! Keep-alive table
//!
//! Owners of in-flight payloads, indexed by slot until their write completes.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::io::CompletionHook;

/// Anything that keeps a payload's memory alive
pub type Owner = Box<dyn Any + Send>;

/// Arena of payload owners
///
/// A slot is taken before the write is submitted and released by the
/// write's completion hook, whatever its outcome.
#[derive(Clone, Default)]
pub(crate) struct KeepAlive {
    slots: Arc<Mutex<Slab<Owner>>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `owner`; returns its slot
    pub fn hold(&self, owner: Owner) -> usize {
        self.slots.lock().insert(owner)
    }

    /// Hook that drops the owner in `slot` once the write completes
    pub fn release_on_complete(&self, slot: usize) -> CompletionHook {
        let slots = Arc::clone(&self.slots);
        Box::new(move |outcome| {
            // Owner is dropped after the lock is released
            let owner = slots.lock().try_remove(slot);
            drop(owner);
            outcome
        })
    }

    /// Payloads still held
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
