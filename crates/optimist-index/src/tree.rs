//! The concurrent ordered index.
//!
//! An [`OrderedIndex`] maps byte keys to tuple heads through a sorted
//! directory of leaf pages:
//!
//! ```text
//! directory: [ ("", leaf 1) , ("m", leaf 2) , ("t", leaf 3) ]
//!                  │               │               │
//!                  ▼               ▼               ▼
//!               entries         entries         entries
//!             "a".."l"        "m".."s"        "t".."z"
//! ```
//!
//! Each leaf has a stable identity and a structural version counter. The
//! counter changes whenever the leaf's key membership changes - on entry
//! insert, entry removal, and split - but not when an existing entry's
//! tuple pointer is swapped. Observing a leaf's version therefore pins its
//! key set: if the version still matches later, no key appeared in or
//! vanished from that leaf in between. That is the entire contract scan
//! validation needs.
//!
//! Latching is internal: the directory and each leaf's entry vector sit
//! behind `parking_lot::RwLock`s, and splits take the directory write
//! lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use optimist_common::constants::DEFAULT_LEAF_FANOUT;
use optimist_common::types::Key;

use crate::tuple::Tuple;

/// A leaf page: a sorted run of key/tuple entries with a stable id and a
/// structural version counter.
pub struct Leaf {
    id: u64,
    version: AtomicU64,
    entries: RwLock<Vec<(Key, Arc<Tuple>)>>,
}

impl Leaf {
    fn new(id: u64, entries: Vec<(Key, Arc<Tuple>)>) -> Arc<Self> {
        Arc::new(Self {
            id,
            version: AtomicU64::new(0),
            entries: RwLock::new(entries),
        })
    }

    /// Stable identity of this leaf, for logging.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current structural version.
    #[must_use]
    pub fn version_number(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bumps the structural version, returning the value it had before.
    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel)
    }

    /// Snapshot of the entries at a single structural version.
    fn stable_entries(&self) -> (u64, Vec<(Key, Arc<Tuple>)>) {
        loop {
            let v1 = self.version_number();
            let snap = self.entries.read().clone();
            let v2 = self.version_number();
            if v1 == v2 {
                return (v1, snap);
            }
        }
    }
}

impl std::fmt::Debug for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaf")
            .field("id", &self.id)
            .field("version", &self.version_number())
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

/// Where an `insert_if_absent` landed.
#[derive(Debug)]
pub struct InsertInfo {
    /// The leaf the key went into.
    pub leaf: Arc<Leaf>,
    /// The leaf's structural version observed at the insertion; the insert
    /// itself advanced the counter to one past this.
    pub version: u64,
}

/// Visitor for [`OrderedIndex::search_range_call`].
pub trait RangeVisitor {
    /// Called once per visited leaf with the structural version its
    /// entries were read at. Return `false` to halt the scan.
    fn visit_node(&mut self, _leaf: &Arc<Leaf>, _version: u64) -> bool {
        true
    }

    /// Called for each entry in range, in key order. Return `false` to
    /// halt the scan.
    fn visit(&mut self, key: &Key, tuple: &Arc<Tuple>) -> bool;
}

/// A concurrent ordered map from byte keys to tuple heads.
pub struct OrderedIndex {
    /// Sorted (lower bound, leaf) pairs; the first bound is always empty.
    directory: RwLock<Vec<(Key, Arc<Leaf>)>>,
    next_leaf_id: AtomicU64,
    fanout: usize,
    splits: AtomicU64,
}

impl OrderedIndex {
    /// Creates an empty index with the default leaf fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fanout(DEFAULT_LEAF_FANOUT)
    }

    /// Creates an empty index splitting leaves at `fanout` entries.
    #[must_use]
    pub fn with_fanout(fanout: usize) -> Self {
        assert!(fanout >= 2, "leaf fanout must be at least 2");
        Self {
            directory: RwLock::new(vec![(Key::empty(), Leaf::new(0, Vec::new()))]),
            next_leaf_id: AtomicU64::new(1),
            fanout,
            splits: AtomicU64::new(0),
        }
    }

    /// Number of leaf splits performed.
    #[must_use]
    pub fn split_count(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    /// Total number of entries across all leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory
            .read()
            .iter()
            .map(|(_, leaf)| leaf.entries.read().len())
            .sum()
    }

    /// True if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the leaf covering `key` in a sorted directory.
    fn locate(directory: &[(Key, Arc<Leaf>)], key: &[u8]) -> usize {
        directory
            .partition_point(|(bound, _)| bound.as_bytes() <= key)
            .saturating_sub(1)
    }

    /// Looks up the tuple head for `key`.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<Arc<Tuple>> {
        let directory = self.directory.read();
        let (_, leaf) = &directory[Self::locate(&directory, key)];
        let entries = leaf.entries.read();
        entries
            .binary_search_by(|(k, _)| k.as_bytes().cmp(key))
            .ok()
            .map(|i| Arc::clone(&entries[i].1))
    }

    /// Inserts `tuple` under `key` if the key is absent.
    ///
    /// On success reports the leaf and the structural version observed at
    /// the insertion. On conflict returns the existing tuple.
    pub fn insert_if_absent(
        &self,
        key: Key,
        tuple: Arc<Tuple>,
    ) -> Result<InsertInfo, Arc<Tuple>> {
        loop {
            let directory = self.directory.read();
            let (_, leaf) = &directory[Self::locate(&directory, &key)];
            let leaf = Arc::clone(leaf);
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(i) => return Err(Arc::clone(&entries[i].1)),
                Err(pos) => {
                    if entries.len() >= self.fanout {
                        drop(entries);
                        drop(directory);
                        self.split(&leaf);
                        continue;
                    }
                    entries.insert(pos, (key, tuple));
                    let version = leaf.bump();
                    drop(entries);
                    return Ok(InsertInfo { leaf, version });
                }
            }
        }
    }

    /// Upserts `tuple` under `key`, returning the previous tuple if any.
    ///
    /// Replacing an existing entry's tuple does not change the leaf's key
    /// membership and therefore leaves its structural version alone.
    pub fn insert(&self, key: Key, tuple: Arc<Tuple>) -> Option<Arc<Tuple>> {
        loop {
            let directory = self.directory.read();
            let (_, leaf) = &directory[Self::locate(&directory, &key)];
            let leaf = Arc::clone(leaf);
            let mut entries = leaf.entries.write();
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(i) => {
                    let old = std::mem::replace(&mut entries[i].1, tuple);
                    return Some(old);
                }
                Err(pos) => {
                    if entries.len() >= self.fanout {
                        drop(entries);
                        drop(directory);
                        self.split(&leaf);
                        continue;
                    }
                    entries.insert(pos, (key, tuple));
                    leaf.bump();
                    return None;
                }
            }
        }
    }

    /// Removes the entry for `key`, returning its tuple.
    pub fn remove(&self, key: &[u8]) -> Option<Arc<Tuple>> {
        let directory = self.directory.read();
        let (_, leaf) = &directory[Self::locate(&directory, key)];
        let mut entries = leaf.entries.write();
        match entries.binary_search_by(|(k, _)| k.as_bytes().cmp(key)) {
            Ok(i) => {
                let (_, tuple) = entries.remove(i);
                leaf.bump();
                Some(tuple)
            }
            Err(_) => None,
        }
    }

    /// Splits `leaf` in half, registering the upper half as a new leaf.
    fn split(&self, leaf: &Arc<Leaf>) {
        let mut directory = self.directory.write();
        let pos = match directory
            .iter()
            .position(|(_, l)| Arc::ptr_eq(l, leaf))
        {
            Some(pos) => pos,
            None => return,
        };
        let mut entries = leaf.entries.write();
        if entries.len() < self.fanout {
            // Lost the race to another splitter.
            return;
        }
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let bound = upper[0].0.clone();
        let id = self.next_leaf_id.fetch_add(1, Ordering::Relaxed);
        let new_leaf = Leaf::new(id, upper);
        leaf.bump();
        drop(entries);
        directory.insert(pos + 1, (bound.clone(), new_leaf));
        self.splits.fetch_add(1, Ordering::Relaxed);
        trace!(leaf = leaf.id(), new_leaf = id, bound = ?bound, "leaf split");
    }

    /// Visits every entry with key in `[lo, hi)` in order, reporting each
    /// visited leaf and the structural version its entries were read at.
    /// An absent `hi` leaves the range open-ended.
    pub fn search_range_call(&self, lo: &[u8], hi: Option<&[u8]>, visitor: &mut dyn RangeVisitor) {
        let mut cursor = Key::from_bytes(lo);
        loop {
            let leaf = {
                let directory = self.directory.read();
                Arc::clone(&directory[Self::locate(&directory, &cursor)].1)
            };
            let (version, snapshot) = leaf.stable_entries();
            // The bound must be read after the snapshot: a split in
            // between would shrink this leaf's coverage and the stale
            // bound would skip its new sibling. The version re-check
            // pairs the snapshot with the bound consistently.
            let next_bound = {
                let directory = self.directory.read();
                let pos = directory
                    .iter()
                    .position(|(_, l)| Arc::ptr_eq(l, &leaf))
                    .expect("leaves are never unlinked");
                directory.get(pos + 1).map(|(bound, _)| bound.clone())
            };
            if leaf.version_number() != version {
                continue;
            }
            if !visitor.visit_node(&leaf, version) {
                return;
            }
            let mut last_visited: Option<Key> = None;
            for (key, tuple) in &snapshot {
                if key < &cursor {
                    continue;
                }
                if let Some(hi) = hi {
                    if key.as_bytes() >= hi {
                        return;
                    }
                }
                last_visited = Some(key.clone());
                if !visitor.visit(key, tuple) {
                    return;
                }
            }
            // Continue past both the directory bound and anything already
            // delivered; a concurrent split may otherwise replay entries.
            let next_cursor = match (next_bound, last_visited) {
                (Some(bound), Some(last)) => bound.max(last.successor()),
                (Some(bound), None) => bound,
                (None, _) => return,
            };
            if let Some(hi) = hi {
                if next_cursor.as_bytes() >= hi {
                    return;
                }
            }
            cursor = next_cursor;
        }
    }
}

impl Default for OrderedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedIndex")
            .field("leaves", &self.directory.read().len())
            .field("entries", &self.len())
            .field("splits", &self.split_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimist_common::types::Tid;

    fn tuple(data: &[u8]) -> Arc<Tuple> {
        let t = Tuple::alloc_first(true, data);
        t.lock(true);
        t.set_tid(Tid::new(1));
        t.unlock();
        t
    }

    struct Collecting {
        keys: Vec<Key>,
        nodes: Vec<(u64, u64)>,
        stop_after: Option<usize>,
    }

    impl Collecting {
        fn new() -> Self {
            Self {
                keys: Vec::new(),
                nodes: Vec::new(),
                stop_after: None,
            }
        }
    }

    impl RangeVisitor for Collecting {
        fn visit_node(&mut self, leaf: &Arc<Leaf>, version: u64) -> bool {
            self.nodes.push((leaf.id(), version));
            true
        }

        fn visit(&mut self, key: &Key, _tuple: &Arc<Tuple>) -> bool {
            self.keys.push(key.clone());
            if let Some(n) = self.stop_after {
                if self.keys.len() >= n {
                    return false;
                }
            }
            true
        }
    }

    #[test]
    fn test_insert_and_search() {
        let index = OrderedIndex::new();
        assert!(index.is_empty());

        index
            .insert_if_absent(Key::from("b"), tuple(b"vb"))
            .unwrap();
        index
            .insert_if_absent(Key::from("a"), tuple(b"va"))
            .unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.search(b"a").is_some());
        assert!(index.search(b"b").is_some());
        assert!(index.search(b"c").is_none());
    }

    #[test]
    fn test_insert_if_absent_conflict() {
        let index = OrderedIndex::new();
        let first = tuple(b"v1");
        index
            .insert_if_absent(Key::from("k"), Arc::clone(&first))
            .unwrap();

        let err = index
            .insert_if_absent(Key::from("k"), tuple(b"v2"))
            .unwrap_err();
        assert!(Arc::ptr_eq(&err, &first));
    }

    #[test]
    fn test_insert_reports_pre_insert_version() {
        let index = OrderedIndex::new();
        let info = index
            .insert_if_absent(Key::from("a"), tuple(b"v"))
            .unwrap();
        assert_eq!(info.version, 0);
        assert_eq!(info.leaf.version_number(), 1);

        let info = index
            .insert_if_absent(Key::from("b"), tuple(b"v"))
            .unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.leaf.version_number(), 2);
    }

    #[test]
    fn test_upsert_leaves_version_alone() {
        let index = OrderedIndex::new();
        let info = index
            .insert_if_absent(Key::from("k"), tuple(b"v1"))
            .unwrap();
        let v = info.leaf.version_number();

        let old = index.insert(Key::from("k"), tuple(b"v2"));
        assert!(old.is_some());
        assert_eq!(info.leaf.version_number(), v);
    }

    #[test]
    fn test_remove_bumps_version() {
        let index = OrderedIndex::new();
        let info = index
            .insert_if_absent(Key::from("k"), tuple(b"v"))
            .unwrap();
        let v = info.leaf.version_number();

        assert!(index.remove(b"k").is_some());
        assert!(index.remove(b"k").is_none());
        assert_eq!(index.len(), 0);
        assert_eq!(info.leaf.version_number(), v + 1);
    }

    #[test]
    fn test_split_keeps_order_and_bumps_source() {
        let index = OrderedIndex::with_fanout(4);
        for i in 0..32u32 {
            let key = Key::from_vec(format!("{:04}", i).into_bytes());
            index.insert_if_absent(key, tuple(b"v")).unwrap();
        }
        assert_eq!(index.len(), 32);
        assert!(index.split_count() > 0);

        for i in 0..32u32 {
            let key = format!("{:04}", i);
            assert!(index.search(key.as_bytes()).is_some(), "missing {}", key);
        }

        let mut visitor = Collecting::new();
        index.search_range_call(b"", None, &mut visitor);
        let keys: Vec<_> = visitor
            .keys
            .iter()
            .map(|k| String::from_utf8_lossy(k.as_bytes()).into_owned())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys.len(), 32);
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_range_scan_bounds() {
        let index = OrderedIndex::with_fanout(4);
        for k in ["a", "c", "e", "g", "i", "k"] {
            index.insert_if_absent(Key::from(k), tuple(b"v")).unwrap();
        }

        let mut visitor = Collecting::new();
        index.search_range_call(b"c", Some(b"i"), &mut visitor);
        let keys: Vec<_> = visitor.keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"e".to_vec(), b"g".to_vec()]);
        assert!(!visitor.nodes.is_empty());
    }

    #[test]
    fn test_range_scan_visits_empty_leaf() {
        let index = OrderedIndex::new();
        let mut visitor = Collecting::new();
        index.search_range_call(b"a", Some(b"z"), &mut visitor);
        assert!(visitor.keys.is_empty());
        assert_eq!(visitor.nodes.len(), 1);
    }

    #[test]
    fn test_range_scan_early_stop() {
        let index = OrderedIndex::new();
        for k in ["a", "b", "c", "d"] {
            index.insert_if_absent(Key::from(k), tuple(b"v")).unwrap();
        }
        let mut visitor = Collecting::new();
        visitor.stop_after = Some(2);
        index.search_range_call(b"", None, &mut visitor);
        assert_eq!(visitor.keys.len(), 2);
    }

    #[test]
    fn test_insert_changes_scanned_node_version() {
        let index = OrderedIndex::new();
        index.insert_if_absent(Key::from("b"), tuple(b"v")).unwrap();

        let mut visitor = Collecting::new();
        index.search_range_call(b"a", Some(b"z"), &mut visitor);
        let (leaf_id, version) = visitor.nodes[0];

        index.insert_if_absent(Key::from("c"), tuple(b"v")).unwrap();

        let mut visitor = Collecting::new();
        index.search_range_call(b"a", Some(b"z"), &mut visitor);
        let (leaf_id_2, version_2) = visitor.nodes[0];
        assert_eq!(leaf_id, leaf_id_2);
        assert!(version_2 > version);
    }
}
