//! Store assembly.
//!
//! A [`Store`] wires the pieces together: the concurrency protocol, the
//! reclamation domain, the shared stats block, and a registry of named
//! indexes. Transactions are handed out with [`Store::begin`], already
//! pinned inside a reclamation region.

use std::sync::Arc;

use dashmap::DashMap;

use optimist_common::constants::DEFAULT_LEAF_FANOUT;
use optimist_index::OrderedIndex;
use optimist_reclaim::ReclaimDomain;

use crate::protocol::{ConcurrencyControl, OccProtocol};
use crate::stats::TxnStats;
use crate::transaction::{Transaction, TxnFlags};

/// Store construction knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Entries per index leaf before it splits.
    pub leaf_fanout: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            leaf_fanout: DEFAULT_LEAF_FANOUT,
        }
    }
}

/// An in-memory multi-index transactional store.
pub struct Store {
    protocol: Arc<dyn ConcurrencyControl>,
    domain: Arc<ReclaimDomain>,
    indexes: DashMap<String, Arc<OrderedIndex>>,
    stats: Arc<TxnStats>,
    config: StoreConfig,
}

impl Store {
    /// Creates a store with the stock protocol and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a store with custom configuration.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        let domain = ReclaimDomain::new();
        let protocol: Arc<dyn ConcurrencyControl> =
            Arc::new(OccProtocol::new(Arc::clone(&domain)));
        Self::assemble(protocol, domain, config)
    }

    /// Creates a store around a custom concurrency protocol.
    #[must_use]
    pub fn with_protocol(
        protocol: Arc<dyn ConcurrencyControl>,
        domain: Arc<ReclaimDomain>,
    ) -> Self {
        Self::assemble(protocol, domain, StoreConfig::default())
    }

    fn assemble(
        protocol: Arc<dyn ConcurrencyControl>,
        domain: Arc<ReclaimDomain>,
        config: StoreConfig,
    ) -> Self {
        Self {
            protocol,
            domain,
            indexes: DashMap::new(),
            stats: Arc::new(TxnStats::default()),
            config,
        }
    }

    /// Returns the named index, creating it on first use.
    #[must_use]
    pub fn index(&self, name: &str) -> Arc<OrderedIndex> {
        self.indexes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OrderedIndex::with_fanout(self.config.leaf_fanout)))
            .clone()
    }

    /// Begins a transaction, entering a reclamation region that stays
    /// open for the transaction's lifetime.
    #[must_use]
    pub fn begin(&self, flags: TxnFlags) -> Transaction {
        Transaction::new(
            Arc::clone(&self.protocol),
            Arc::clone(&self.stats),
            flags,
            self.domain.enter(),
        )
    }

    /// Shared transaction statistics.
    #[must_use]
    pub fn stats(&self) -> &TxnStats {
        &self.stats
    }

    /// The reclamation domain.
    #[must_use]
    pub fn domain(&self) -> &Arc<ReclaimDomain> {
        &self.domain
    }

    /// Drains all reclamation work that has quiesced.
    pub fn collect(&self) -> usize {
        self.domain.collect_all()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("indexes", &self.indexes.len())
            .field("commits", &self.stats.total_commits())
            .field("aborts", &self.stats.total_aborts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimist_common::error::AbortReason;
    use optimist_common::types::{Key, Value};
    use crate::transaction::TxnState;

    fn put_commit(store: &Store, index_name: &str, key: &str, value: &str) {
        let index = store.index(index_name);
        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&index, key, value).unwrap();
        assert!(txn.commit(false).unwrap());
    }

    fn read(store: &Store, index_name: &str, key: &str) -> Option<Value> {
        let index = store.index(index_name);
        let mut txn = store.begin(TxnFlags::NONE);
        let value = txn.get(&index, key.as_bytes()).unwrap();
        assert!(txn.commit(false).unwrap());
        value
    }

    #[test]
    fn test_empty_transaction_commits() {
        let store = Store::new();
        let mut txn = store.begin(TxnFlags::NONE);
        assert_eq!(txn.state(), TxnState::Embryo);
        assert!(txn.commit(false).unwrap());
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let store = Store::new();
        put_commit(&store, "t", "k", "v");
        assert_eq!(read(&store, "t", "k"), Some(Value::from("v")));
        assert_eq!(read(&store, "t", "missing"), None);
    }

    #[test]
    fn test_read_your_own_writes() {
        let store = Store::new();
        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&index, "k", "v").unwrap();
        assert_eq!(txn.get(&index, b"k").unwrap(), Some(Value::from("v")));
        txn.remove(&index, "k").unwrap();
        assert_eq!(txn.get(&index, b"k").unwrap(), None);
        assert!(txn.commit(false).unwrap());
    }

    #[test]
    fn test_tombstone_reads_as_absent() {
        let store = Store::new();
        put_commit(&store, "t", "k", "v");

        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::NONE);
        txn.remove(&index, "k").unwrap();
        assert!(txn.commit(false).unwrap());

        assert_eq!(read(&store, "t", "k"), None);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let store = Store::new();
        put_commit(&store, "t", "k", "v1");
        put_commit(&store, "t", "k", "v2");
        assert_eq!(read(&store, "t", "k"), Some(Value::from("v2")));
    }

    #[test]
    fn test_commit_on_committed_returns_true() {
        let store = Store::new();
        let mut txn = store.begin(TxnFlags::NONE);
        assert!(txn.commit(false).unwrap());
        assert!(txn.commit(false).unwrap());
        assert!(txn.commit(true).unwrap());
    }

    #[test]
    fn test_commit_after_abort_reports_reason() {
        let store = Store::new();
        let mut txn = store.begin(TxnFlags::NONE);
        let index = store.index("t");
        txn.put(&index, "k", "v").unwrap();
        txn.abort().unwrap();

        assert!(!txn.commit(false).unwrap());
        let err = txn.commit(true).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::User));
    }

    #[test]
    fn test_abort_is_idempotent_but_not_after_commit() {
        let store = Store::new();
        let mut txn = store.begin(TxnFlags::NONE);
        txn.abort().unwrap();
        txn.abort().unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);

        let mut txn = store.begin(TxnFlags::NONE);
        assert!(txn.commit(false).unwrap());
        assert!(txn.abort().is_err());
    }

    #[test]
    fn test_terminal_transaction_is_unusable() {
        let store = Store::new();
        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::NONE);
        assert!(txn.commit(false).unwrap());
        assert!(txn.get(&index, b"k").is_err());
        assert!(txn.put(&index, "k", "v").is_err());
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let store = Store::new();
        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::READ_ONLY);
        assert!(txn.put(&index, "k", "v").is_err());
        txn.abort().unwrap();
    }

    #[test]
    fn test_read_invalidation_aborts() {
        let store = Store::new();
        put_commit(&store, "t", "x", "v0");
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        assert_eq!(t1.get(&index, b"x").unwrap(), Some(Value::from("v0")));

        put_commit(&store, "t", "x", "v1");

        assert!(!t1.commit(false).unwrap());
        assert_eq!(t1.abort_reason(), Some(AbortReason::ReadNodeInterference));
        assert_eq!(
            store.stats().aborts_for(AbortReason::ReadNodeInterference),
            1
        );
    }

    #[test]
    fn test_absence_invalidation_aborts() {
        let store = Store::new();
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        assert_eq!(t1.get(&index, b"y").unwrap(), None);

        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "y", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        t1.put(&index, "z", "w").unwrap();
        assert!(!t1.commit(false).unwrap());
        assert_eq!(
            t1.abort_reason(),
            Some(AbortReason::ReadAbsenceInterference)
        );
    }

    #[test]
    fn test_range_phantom_aborts() {
        let store = Store::new();
        put_commit(&store, "t", "a", "v");
        put_commit(&store, "t", "z", "v");
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        let mut seen = Vec::new();
        t1.scan(&index, b"m", Some(b"p"), &mut |key, _value| {
            seen.push(key.clone());
            true
        })
        .unwrap();
        assert!(seen.is_empty());

        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "n", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        assert!(!t1.commit(false).unwrap());
        assert_eq!(
            t1.abort_reason(),
            Some(AbortReason::WriteNodeInterference)
        );
    }

    #[test]
    fn test_range_scan_without_phantom_commits() {
        let store = Store::new();
        put_commit(&store, "t", "a", "v");
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        t1.scan(&index, b"m", Some(b"p"), &mut |_, _| true).unwrap();

        // An insert outside the scanned range does not interfere.
        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "q", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        assert!(t1.commit(false).unwrap());
    }

    #[test]
    fn test_node_scan_phantom_aborts() {
        let store = Store::new();
        put_commit(&store, "t", "a", "v");
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NODE_SCAN);
        t1.scan(&index, b"m", Some(b"p"), &mut |_, _| true).unwrap();

        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "n", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        assert!(!t1.commit(false).unwrap());
        assert_eq!(
            t1.abort_reason(),
            Some(AbortReason::NodeScanVersionChanged)
        );
    }

    #[test]
    fn test_node_scan_insert_into_scanned_leaf() {
        let store = Store::new();
        put_commit(&store, "t", "b", "v");
        let index = store.index("t");

        // Our own insert into a scanned leaf is accounted for.
        let mut t1 = store.begin(TxnFlags::NODE_SCAN);
        t1.scan(&index, b"a", Some(b"z"), &mut |_, _| true).unwrap();
        t1.insert(&index, "c", "v").unwrap();
        assert!(t1.commit(false).unwrap());

        // A foreign insert between scan and commit is not.
        let mut t1 = store.begin(TxnFlags::NODE_SCAN);
        t1.scan(&index, b"a", Some(b"z"), &mut |_, _| true).unwrap();
        t1.insert(&index, "e", "v").unwrap();

        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "d", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        assert!(!t1.commit(false).unwrap());
        assert_eq!(
            t1.abort_reason(),
            Some(AbortReason::WriteNodeInterference)
        );
    }

    #[test]
    fn test_write_past_begin_point_aborts() {
        let store = Store::new();
        put_commit(&store, "t", "a", "v0");
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        let mut t2 = store.begin(TxnFlags::NONE);
        t1.put(&index, "a", "v1").unwrap();
        t2.put(&index, "a", "v2").unwrap();

        assert!(t1.commit(false).unwrap());
        assert!(!t2.commit(false).unwrap());
        assert_eq!(
            t2.abort_reason(),
            Some(AbortReason::WriteNodeInterference)
        );
        assert_eq!(read(&store, "t", "a"), Some(Value::from("v1")));
    }

    #[test]
    fn test_disjoint_writes_both_commit() {
        let store = Store::new();
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        let mut t2 = store.begin(TxnFlags::NONE);
        t1.put(&index, "a", "1").unwrap();
        t2.put(&index, "b", "2").unwrap();

        assert!(t1.commit(false).unwrap());
        assert!(t2.commit(false).unwrap());
        assert_eq!(read(&store, "t", "a"), Some(Value::from("1")));
        assert_eq!(read(&store, "t", "b"), Some(Value::from("2")));
    }

    #[test]
    fn test_read_only_snapshot_is_repeatable() {
        let store = Store::new();
        put_commit(&store, "t", "x", "v1");
        let index = store.index("t");

        let mut reader = store.begin(TxnFlags::READ_ONLY);
        assert!(reader.snapshot_tid().is_some());
        assert_eq!(reader.get(&index, b"x").unwrap(), Some(Value::from("v1")));

        // A later committed overwrite stays invisible.
        put_commit(&store, "t", "x", "v2");
        assert_eq!(reader.get(&index, b"x").unwrap(), Some(Value::from("v1")));

        // And the reader commits without validating or locking.
        assert!(reader.commit(false).unwrap());
        assert_eq!(store.stats().total_aborts(), 0);
    }

    #[test]
    fn test_read_only_snapshot_misses_later_inserts() {
        let store = Store::new();
        put_commit(&store, "t", "a", "v");
        let index = store.index("t");

        let mut reader = store.begin(TxnFlags::READ_ONLY);
        put_commit(&store, "t", "b", "v");
        assert_eq!(reader.get(&index, b"b").unwrap(), None);
        assert!(reader.commit(false).unwrap());
    }

    #[test]
    fn test_value_growth_replaces_head() {
        let store = Store::new();
        put_commit(&store, "t", "k", "small");

        let big = "x".repeat(4096);
        put_commit(&store, "t", "k", &big);

        assert_eq!(read(&store, "t", "k"), Some(Value::from(big.as_str())));
        assert!(store.stats().latest_replacements.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_scan_sees_buffered_writes() {
        let store = Store::new();
        put_commit(&store, "t", "a", "va");
        put_commit(&store, "t", "b", "vb");
        let index = store.index("t");

        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&index, "a", "shadowed").unwrap();
        txn.remove(&index, "b").unwrap();

        let mut seen = Vec::new();
        txn.scan(&index, b"", None, &mut |key, value| {
            seen.push((
                String::from_utf8_lossy(key.as_bytes()).into_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
            true
        })
        .unwrap();
        assert_eq!(seen, vec![("a".to_string(), "shadowed".to_string())]);
        txn.abort().unwrap();
    }

    #[test]
    fn test_scan_early_halt_limits_absent_range() {
        let store = Store::new();
        for key in ["a", "b", "c", "d"] {
            put_commit(&store, "t", key, "v");
        }
        let index = store.index("t");

        let mut t1 = store.begin(TxnFlags::NONE);
        let mut count = 0;
        t1.scan(&index, b"", None, &mut |_, _| {
            count += 1;
            count < 2
        })
        .unwrap();
        assert_eq!(count, 2);

        // An insert beyond where the scan stopped does not interfere.
        let mut t2 = store.begin(TxnFlags::NONE);
        t2.insert(&index, "z", "v").unwrap();
        assert!(t2.commit(false).unwrap());

        assert!(t1.commit(false).unwrap());
    }

    #[test]
    fn test_tombstone_unlinked_after_quiescence() {
        let store = Store::new();
        put_commit(&store, "t", "k", "v");
        let index = store.index("t");
        assert_eq!(index.len(), 1);

        {
            let mut txn = store.begin(TxnFlags::NONE);
            txn.remove(&index, "k").unwrap();
            assert!(txn.commit(false).unwrap());
        }

        store.collect();
        assert_eq!(index.len(), 0);
        assert!(index.search(b"k").is_none());
    }

    #[test]
    fn test_insert_fast_path_and_counters() {
        let store = Store::new();
        let index = store.index("t");

        let mut txn = store.begin(TxnFlags::NONE);
        txn.insert(&index, "k", "v").unwrap();
        assert!(txn.commit(false).unwrap());

        // The direct insert path never ran a search.
        let stats = store.stats();
        assert_eq!(
            stats
                .write_search_failed
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
        assert_eq!(stats.total_commits(), 1);
        assert_eq!(
            stats.max_write_set.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_local_search_counters() {
        let store = Store::new();
        let index = store.index("t");

        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&index, "k", "v").unwrap();
        assert_eq!(txn.get(&index, b"k").unwrap(), Some(Value::from("v")));
        assert!(txn.commit(false).unwrap());

        let stats = store.stats();
        assert_eq!(
            stats
                .local_write_set_hits
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_remove_of_missing_key_commits() {
        let store = Store::new();
        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::NONE);
        txn.remove(&index, "ghost").unwrap();
        assert!(txn.commit(false).unwrap());
        assert_eq!(read(&store, "t", "ghost"), None);
    }

    #[test]
    fn test_separate_indexes_are_independent() {
        let store = Store::new();
        put_commit(&store, "left", "k", "l");
        put_commit(&store, "right", "k", "r");
        assert_eq!(read(&store, "left", "k"), Some(Value::from("l")));
        assert_eq!(read(&store, "right", "k"), Some(Value::from("r")));

        let left = store.index("left");
        let right = store.index("right");
        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&left, "k2", "l2").unwrap();
        txn.put(&right, "k2", "r2").unwrap();
        assert!(txn.commit(false).unwrap());
        assert_eq!(
            store
                .stats()
                .max_contexts
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn test_transaction_counters() {
        let store = Store::new();
        let left = store.index("left");
        let right = store.index("right");

        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&left, "a", "1").unwrap();
        txn.put(&left, "b", "2").unwrap();
        txn.get(&right, b"missing").unwrap();

        let counters = txn.counters();
        assert_eq!(counters.contexts, 2);
        assert_eq!(counters.max_write_set, 2);
        assert_eq!(counters.max_absent_set, 1);
        assert_eq!(counters.max_read_set, 0);
        assert!(txn.commit(false).unwrap());
    }

    #[test]
    fn test_key_debug_output_in_transaction() {
        let store = Store::new();
        let index = store.index("t");
        let mut txn = store.begin(TxnFlags::NONE);
        txn.put(&index, Key::from("k"), Value::from("v")).unwrap();
        let debug = format!("{:?}", txn);
        assert!(debug.contains("Active"));
        assert!(txn.commit(false).unwrap());
    }
}
