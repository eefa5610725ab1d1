//! Small-buffer-optimized maps for per-transaction sets.
//!
//! The read, absent, write, and node-scan sets of most transactions hold a
//! handful of entries, so a linear scan over an inline vector beats a hash
//! map. Past [`SMALL_MAP_INLINE`] entries the map promotes itself to a
//! `HashMap`; [`SmallMap::is_small`] reports which representation is live
//! so the stats layer can count promotions.

use std::collections::HashMap;
use std::hash::Hash;

use optimist_common::constants::SMALL_MAP_INLINE;

/// A map inlined as a vector of pairs until it outgrows the threshold.
#[derive(Debug, Clone)]
pub enum SmallMap<K, V> {
    /// Inline representation: unsorted pairs, scanned linearly.
    Inline(Vec<(K, V)>),
    /// Promoted representation.
    Spilled(HashMap<K, V>),
}

impl<K: Eq + Hash, V> SmallMap<K, V> {
    /// Creates an empty map in the inline representation.
    #[must_use]
    pub fn new() -> Self {
        SmallMap::Inline(Vec::new())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            SmallMap::Inline(v) => v.len(),
            SmallMap::Spilled(m) => m.len(),
        }
    }

    /// True if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the map is still inline.
    #[must_use]
    pub fn is_small(&self) -> bool {
        matches!(self, SmallMap::Inline(_))
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        match self {
            SmallMap::Inline(v) => v.iter().find(|(k, _)| k == key).map(|(_, val)| val),
            SmallMap::Spilled(m) => m.get(key),
        }
    }

    /// Looks up a value mutably.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self {
            SmallMap::Inline(v) => v.iter_mut().find(|(k, _)| k == key).map(|(_, val)| val),
            SmallMap::Spilled(m) => m.get_mut(key),
        }
    }

    /// True if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts a pair, returning the previous value for the key if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self {
            SmallMap::Inline(v) => {
                if let Some((_, slot)) = v.iter_mut().find(|(k, _)| *k == key) {
                    return Some(std::mem::replace(slot, value));
                }
                if v.len() < SMALL_MAP_INLINE {
                    v.push((key, value));
                    return None;
                }
                let mut map: HashMap<K, V> = std::mem::take(v).into_iter().collect();
                map.insert(key, value);
                *self = SmallMap::Spilled(map);
                None
            }
            SmallMap::Spilled(m) => m.insert(key, value),
        }
    }

    /// Iterates over entries in unspecified order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        match self {
            SmallMap::Inline(v) => Iter::Inline(v.iter()),
            SmallMap::Spilled(m) => Iter::Spilled(m.iter()),
        }
    }

    /// Removes all entries, keeping the inline representation.
    pub fn clear(&mut self) {
        *self = SmallMap::Inline(Vec::new());
    }
}

impl<K: Eq + Hash, V> Default for SmallMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over [`SmallMap`] entries.
pub enum Iter<'a, K, V> {
    /// Inline iteration.
    Inline(std::slice::Iter<'a, (K, V)>),
    /// Hash-map iteration.
    Spilled(std::collections::hash_map::Iter<'a, K, V>),
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Iter::Inline(it) => it.next().map(|(k, v)| (k, v)),
            Iter::Spilled(it) => it.next(),
        }
    }
}
