//! Per-index transaction context.
//!
//! Each index a transaction touches gets its own [`TxnContext`] recording
//! everything commit-time validation will need:
//!
//! - `read_set`: tuple → tid observed at first read (first read wins)
//! - `absent_set`: key → how its absence was established
//! - `write_set`: key → pending payload (empty = delete) and insert hint
//! - `node_scan`: leaf → structural version observed (node-scan mode only)
//! - `absent_ranges`: proven-empty intervals (range-tracking mode only)

use std::sync::Arc;

use optimist_common::types::{Key, Tid, Value};
use optimist_index::{Leaf, Tuple};

use crate::range::AbsentRanges;
use crate::smallmap::SmallMap;
use crate::stats::TxnStats;

/// Tuple identity for set keys: two refs are equal iff they point at the
/// same record.
#[derive(Clone)]
pub(crate) struct TupleRef(pub(crate) Arc<Tuple>);

impl PartialEq for TupleRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TupleRef {}

impl std::hash::Hash for TupleRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Leaf identity for the node-scan set.
#[derive(Clone)]
pub(crate) struct NodeRef(pub(crate) Arc<Leaf>);

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for NodeRef {}

impl std::hash::Hash for NodeRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// How a key's absence was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbsentKind {
    /// A lookup missed; revalidated by re-searching at commit.
    Read,
    /// The key became a write target; its tuple is checked for a nil
    /// latest value under our lock.
    Write,
    /// We inserted the tuple ourselves, which proved absence.
    Insert,
}

#[derive(Clone)]
pub(crate) struct AbsentRecord {
    pub(crate) kind: AbsentKind,
    pub(crate) tuple: Option<Arc<Tuple>>,
}

#[derive(Clone, Copy)]
pub(crate) struct ReadRecord {
    /// Tid observed at first read.
    pub(crate) t: Tid,
    /// Set during commit once the write path locks this tuple.
    pub(crate) holds_lock: bool,
}

#[derive(Clone)]
pub(crate) struct WriteRecord {
    /// Pending payload; empty means delete.
    pub(crate) value: Value,
    /// Try the direct insert path at commit. Sticky once set.
    pub(crate) insert: bool,
}

/// Everything a transaction tracked against one index.
#[derive(Default)]
pub(crate) struct TxnContext {
    pub(crate) read_set: SmallMap<TupleRef, ReadRecord>,
    pub(crate) absent_set: SmallMap<Key, AbsentRecord>,
    pub(crate) write_set: SmallMap<Key, WriteRecord>,
    pub(crate) node_scan: SmallMap<NodeRef, u64>,
    pub(crate) absent_ranges: AbsentRanges,
}

impl TxnContext {
    /// Local-first lookup: the write set, then the absent set, then (in
    /// range-tracking mode) the absent ranges.
    ///
    /// `Some(Some(v))` is a locally visible value, `Some(None)` a locally
    /// proven absence, `None` means the index must be consulted.
    pub(crate) fn local_search(
        &self,
        key: &[u8],
        range_tracking: bool,
        stats: &TxnStats,
    ) -> Option<Option<Value>> {
        if !self.write_set.is_empty() {
            let probe = Key::from_bytes(key);
            if let Some(w) = self.write_set.get(&probe) {
                stats.bump(&stats.local_write_set_hits);
                if w.value.is_empty() {
                    return Some(None);
                }
                return Some(Some(w.value.clone()));
            }
        }
        if !self.absent_set.is_empty() {
            let probe = Key::from_bytes(key);
            if self.absent_set.contains_key(&probe) {
                stats.bump(&stats.local_absent_set_hits);
                return Some(None);
            }
        }
        if range_tracking && self.absent_ranges.contains_key(key) {
            stats.bump(&stats.local_absent_range_hits);
            return Some(None);
        }
        None
    }

    /// Records an observed tuple version; the first observation wins.
    pub(crate) fn record_read(&mut self, tuple: Arc<Tuple>, t: Tid) {
        let key = TupleRef(tuple);
        if !self.read_set.contains_key(&key) {
            self.read_set.insert(key, ReadRecord {
                t,
                holds_lock: false,
            });
        }
    }

    /// Records a lookup miss; never downgrades an existing record.
    pub(crate) fn record_absent_read(&mut self, key: Key) {
        if !self.absent_set.contains_key(&key) {
            self.absent_set.insert(key, AbsentRecord {
                kind: AbsentKind::Read,
                tuple: None,
            });
        }
    }

    /// Records a pending write. The payload always takes the latest value;
    /// the insert hint is sticky once set.
    pub(crate) fn record_write(&mut self, key: Key, value: Value, insert: bool) {
        if let Some(existing) = self.write_set.get_mut(&key) {
            existing.value = value;
            existing.insert |= insert;
            return;
        }
        self.write_set.insert(key, WriteRecord { value, insert });
    }

    /// Records a scanned leaf version; the first observation wins.
    pub(crate) fn record_node(&mut self, leaf: Arc<Leaf>, version: u64) {
        let key = NodeRef(leaf);
        if !self.node_scan.contains_key(&key) {
            self.node_scan.insert(key, version);
        }
    }
}

impl std::fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnContext")
            .field("read_set", &self.read_set.len())
            .field("absent_set", &self.absent_set.len())
            .field("write_set", &self.write_set.len())
            .field("node_scan", &self.node_scan.len())
            .field("absent_ranges", &self.absent_ranges.len())
            .finish()
    }
}
