//! Eviction order for resident pages
//!
//! Entries are ordered by (last access stamp, page index, file). The oldest
//! stamp is evicted first; equal stamps fall back to the lowest page index so
//! eviction is deterministic.

use crate::core::page::{FileId, PageKey};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    stamp: u64,
    index: u64,
    file: FileId,
}

impl Slot {
    fn new(key: PageKey, stamp: u64) -> Self {
        Slot {
            stamp,
            index: key.index,
            file: key.file,
        }
    }

    fn key(&self) -> PageKey {
        PageKey::new(self.file, self.index)
    }
}

#[derive(Debug, Default)]
pub(crate) struct EvictionOrder {
    slots: BTreeSet<Slot>,
}

impl EvictionOrder {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PageKey, stamp: u64) {
        self.slots.insert(Slot::new(key, stamp));
    }

    /// Move `key` from `old_stamp` to `new_stamp`
    pub fn touch(&mut self, key: PageKey, old_stamp: u64, new_stamp: u64) {
        self.slots.remove(&Slot::new(key, old_stamp));
        self.slots.insert(Slot::new(key, new_stamp));
    }

    pub fn remove(&mut self, key: PageKey, stamp: u64) -> bool {
        self.slots.remove(&Slot::new(key, stamp))
    }

    /// Oldest key for which `evictable` holds
    pub fn oldest_where<F>(&self, mut evictable: F) -> Option<PageKey>
    where
        F: FnMut(&PageKey) -> bool,
    {
        self.slots
            .iter()
            .map(Slot::key)
            .find(|key| evictable(key))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
