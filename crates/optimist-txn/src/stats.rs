//! Observability counters for the transaction layer.
//!
//! One [`TxnStats`] block is shared by every transaction a store hands
//! out. All counters are relaxed atomics; they steer nothing and exist
//! purely for measurement.

use std::sync::atomic::{AtomicU64, Ordering};

use optimist_common::error::AbortReason;

use crate::context::TxnContext;

/// Counters for commits, aborts, set shapes, and fast/slow path hits.
#[derive(Debug, Default)]
pub struct TxnStats {
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions aborted, any reason.
    pub aborts: AtomicU64,

    /// Aborts requested by the caller.
    pub aborts_user: AtomicU64,
    /// Aborts from write-target interference.
    pub aborts_write_interference: AtomicU64,
    /// Aborts from read-set invalidation.
    pub aborts_read_interference: AtomicU64,
    /// Aborts from absence invalidation.
    pub aborts_absence_interference: AtomicU64,
    /// Aborts from scanned-node version changes.
    pub aborts_node_scan: AtomicU64,

    /// Local-first lookups attempted.
    pub local_lookups: AtomicU64,
    /// Local lookups answered by the write set.
    pub local_write_set_hits: AtomicU64,
    /// Local lookups answered by the absent set.
    pub local_absent_set_hits: AtomicU64,
    /// Local lookups answered by a proven-absent range.
    pub local_absent_range_hits: AtomicU64,

    /// Write resolutions whose initial search missed.
    pub write_search_failed: AtomicU64,
    /// Direct inserts that lost the race and fell back to search.
    pub write_insert_failed: AtomicU64,
    /// Head tuples replaced because the payload outgrew capacity.
    pub latest_replacements: AtomicU64,

    /// Largest read set observed at commit.
    pub max_read_set: AtomicU64,
    /// Largest absent set observed at commit.
    pub max_absent_set: AtomicU64,
    /// Largest write set observed at commit.
    pub max_write_set: AtomicU64,
    /// Largest node-scan set observed at commit.
    pub max_node_scan: AtomicU64,
    /// Largest absent-range count observed at commit.
    pub max_absent_ranges: AtomicU64,
    /// Most per-index contexts observed in one transaction.
    pub max_contexts: AtomicU64,

    /// Read sets that outgrew the inline representation.
    pub read_set_spills: AtomicU64,
    /// Absent sets that outgrew the inline representation.
    pub absent_set_spills: AtomicU64,
    /// Write sets that outgrew the inline representation.
    pub write_set_spills: AtomicU64,
    /// Node-scan sets that outgrew the inline representation.
    pub node_scan_spills: AtomicU64,
}

impl TxnStats {
    #[inline]
    pub(crate) fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.bump(&self.commits);
    }

    pub(crate) fn record_abort(&self, reason: AbortReason) {
        self.bump(&self.aborts);
        let counter = match reason {
            AbortReason::User => &self.aborts_user,
            AbortReason::WriteNodeInterference => &self.aborts_write_interference,
            AbortReason::ReadNodeInterference => &self.aborts_read_interference,
            AbortReason::ReadAbsenceInterference => &self.aborts_absence_interference,
            AbortReason::NodeScanVersionChanged => &self.aborts_node_scan,
        };
        self.bump(counter);
    }

    pub(crate) fn observe_contexts<'a>(&self, ctxs: impl Iterator<Item = &'a TxnContext>) {
        let mut count = 0u64;
        for ctx in ctxs {
            count += 1;
            self.observe_max(&self.max_read_set, ctx.read_set.len());
            self.observe_max(&self.max_absent_set, ctx.absent_set.len());
            self.observe_max(&self.max_write_set, ctx.write_set.len());
            self.observe_max(&self.max_node_scan, ctx.node_scan.len());
            self.observe_max(&self.max_absent_ranges, ctx.absent_ranges.len());
            if !ctx.read_set.is_small() {
                self.bump(&self.read_set_spills);
            }
            if !ctx.absent_set.is_small() {
                self.bump(&self.absent_set_spills);
            }
            if !ctx.write_set.is_small() {
                self.bump(&self.write_set_spills);
            }
            if !ctx.node_scan.is_small() {
                self.bump(&self.node_scan_spills);
            }
        }
        self.observe_max(&self.max_contexts, count as usize);
    }

    fn observe_max(&self, counter: &AtomicU64, value: usize) {
        counter.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Total committed transactions.
    pub fn total_commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Total aborted transactions.
    pub fn total_aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Aborts recorded for one reason.
    pub fn aborts_for(&self, reason: AbortReason) -> u64 {
        let counter = match reason {
            AbortReason::User => &self.aborts_user,
            AbortReason::WriteNodeInterference => &self.aborts_write_interference,
            AbortReason::ReadNodeInterference => &self.aborts_read_interference,
            AbortReason::ReadAbsenceInterference => &self.aborts_absence_interference,
            AbortReason::NodeScanVersionChanged => &self.aborts_node_scan,
        };
        counter.load(Ordering::Relaxed)
    }
}
