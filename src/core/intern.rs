//! Key interning: deduplicate symbol strings (and other hashable keys)
//! into dense integer handles, preserving insertion order.

use crate::core::arena::{entity_id, ArenaError, EntityId};
use std::collections::HashMap;
use std::hash::Hash;

entity_id! {
    /// A stage-local interned name, used for labels and functions.
    pub struct Symbol
}

entity_id! {
    /// A pipeline-wide interned name for cross-stage references.
    pub struct GlobalSymbol
}

/// A bijection between keys and compact integer handles.
///
/// Handles are dense and assigned in insertion order; interning the same
/// key twice returns the original handle.
#[derive(Debug)]
pub struct InternTable<K, H> {
    entries: Vec<K>,
    index: HashMap<K, H>,
}

impl<K, H> Default for InternTable<K, H> {
    fn default() -> InternTable<K, H> {
        InternTable {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K, H> InternTable<K, H>
where
    K: Eq + Hash + Clone,
    H: EntityId,
{
    pub fn new() -> InternTable<K, H> {
        InternTable::default()
    }

    pub fn intern(&mut self, key: K) -> H {
        if let Some(h) = self.index.get(&key) {
            return *h;
        }
        let h = H::from_raw(self.entries.len() as u32);
        self.entries.push(key.clone());
        self.index.insert(key, h);
        h
    }

    pub fn lookup(&self, handle: H) -> Result<&K, ArenaError> {
        self.entries
            .get(handle.as_usize())
            .ok_or(ArenaError::OutOfBounds(handle.as_raw()))
    }

    /// Resolve a key to its handle without interning it.
    pub fn resolve(&self, key: &K) -> Option<H> {
        self.index.get(key).copied()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &K)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(ind, k)| (H::from_raw(ind as u32), k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
