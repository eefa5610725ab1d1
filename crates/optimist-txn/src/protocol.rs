//! The concurrency-protocol capability set.
//!
//! The transaction object is written against [`ConcurrencyControl`], a
//! small trait bundling everything protocol-specific: snapshot
//! availability, tid readability, commit-tid minting, and the
//! finish/spill/delete hooks that feed reclamation. [`OccProtocol`] is the
//! stock implementation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use optimist_common::types::{Key, Tid};
use optimist_index::{OrderedIndex, Tuple};
use optimist_reclaim::ReclaimDomain;

/// Protocol capabilities consumed by the transaction core.
pub trait ConcurrencyControl: Send + Sync {
    /// A tid at or below which every commit has fully installed, if the
    /// protocol can provide one. Read-only transactions pinned to such a
    /// tid skip commit-time validation entirely.
    fn consistent_snapshot_tid(&self) -> Option<Tid> {
        None
    }

    /// The newest tid issued so far; a transaction beginning now may read
    /// versions up to this point.
    fn begin_tid(&self) -> Tid;

    /// Whether a transaction that began at `begin` may overwrite a version
    /// tagged `observed`.
    fn can_read_tid(&self, observed: Tid, begin: Tid) -> bool {
        observed <= begin
    }

    /// Mints a commit tid strictly greater than `observed_max` (the
    /// largest tid in the caller's read and write sets, all locked) and
    /// every tid previously issued.
    fn gen_commit_tid(&self, locked: &[Arc<Tuple>], observed_max: Tid) -> Tid;

    /// Called once a minted tid is fully installed or abandoned.
    fn on_tid_finish(&self, _tid: Tid) {}

    /// A committed write spilled a superseded version onto `tuple`'s
    /// chain.
    fn on_tuple_spill(&self, _index: &Arc<OrderedIndex>, _key: &Key, _tuple: &Arc<Tuple>) {}

    /// A committed write left `tuple` as a logical tombstone.
    fn on_logical_delete(&self, _index: &Arc<OrderedIndex>, _key: &Key, _tuple: &Arc<Tuple>) {}
}

/// Shared tid-minting state.
///
/// Minting and the in-flight registry update happen under one mutex so the
/// watermark can never step over a tid that was minted but not yet
/// registered.
struct TidSource {
    last: AtomicU64,
    inflight: Mutex<BTreeSet<u64>>,
}

impl TidSource {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
            inflight: Mutex::new(BTreeSet::new()),
        }
    }

    fn mint(&self, floor: u64) -> u64 {
        let mut inflight = self.inflight.lock();
        let next = (self.last.load(Ordering::Relaxed) + 1).max(floor + 1);
        self.last.store(next, Ordering::Release);
        inflight.insert(next);
        next
    }

    fn finish(&self, tid: u64) {
        self.inflight.lock().remove(&tid);
    }

    /// Largest tid with no in-flight commit at or below it.
    fn watermark(&self) -> u64 {
        let inflight = self.inflight.lock();
        match inflight.iter().next() {
            Some(&oldest) => oldest - 1,
            None => self.last.load(Ordering::Acquire),
        }
    }
}

/// The stock optimistic protocol.
///
/// Commit tids come from a global monotonic source; the low watermark of
/// minted-but-unfinished tids doubles as the consistent snapshot for
/// read-only transactions. Spill and tombstone cleanup goes through the
/// reclamation domain, bounded by the watermark at retirement, so no
/// snapshot reader can lose a version it still needs.
pub struct OccProtocol {
    tids: Arc<TidSource>,
    domain: Arc<ReclaimDomain>,
}

impl OccProtocol {
    /// Creates a protocol instance backed by `domain`.
    #[must_use]
    pub fn new(domain: Arc<ReclaimDomain>) -> Self {
        Self {
            tids: Arc::new(TidSource::new()),
            domain,
        }
    }

    /// The reclamation domain this protocol defers cleanup through.
    #[must_use]
    pub fn domain(&self) -> &Arc<ReclaimDomain> {
        &self.domain
    }
}

impl ConcurrencyControl for OccProtocol {
    fn consistent_snapshot_tid(&self) -> Option<Tid> {
        Some(Tid::new(self.tids.watermark()))
    }

    fn begin_tid(&self) -> Tid {
        Tid::new(self.tids.last.load(Ordering::Acquire))
    }

    fn gen_commit_tid(&self, locked: &[Arc<Tuple>], observed_max: Tid) -> Tid {
        let mut floor = observed_max;
        for tuple in locked {
            floor = floor.max(tuple.unstable_version().tid());
        }
        let tid = Tid::new(self.tids.mint(floor.as_u64()));
        trace!(%tid, "commit tid minted");
        tid
    }

    fn on_tid_finish(&self, tid: Tid) {
        self.tids.finish(tid.as_u64());
    }

    fn on_tuple_spill(&self, _index: &Arc<OrderedIndex>, key: &Key, tuple: &Arc<Tuple>) {
        // The watermark is captured now: a region entering later holds a
        // snapshot at or above it, and every earlier region blocks the
        // callback. Consulting the watermark at run time instead would
        // let a reader slip in between with an older snapshot.
        let watermark = Tid::new(self.tids.watermark());
        let tuple = Arc::clone(tuple);
        trace!(key = ?key, %watermark, "version spill retired");
        self.domain.defer(move || {
            tuple.prune_chain(watermark);
        });
    }

    fn on_logical_delete(&self, index: &Arc<OrderedIndex>, key: &Key, tuple: &Arc<Tuple>) {
        let tids = Arc::clone(&self.tids);
        let domain = Arc::clone(&self.domain);
        let index = Arc::clone(index);
        let key = key.clone();
        let tuple = Arc::clone(tuple);
        trace!(key = ?key, "tombstone retired");
        self.domain.defer(move || {
            unlink_tombstone(tids, domain, index, key, tuple, false);
        });
    }
}

/// Physically removes a quiesced tombstone from its index.
///
/// Runs in two passes. The first pass only observes the watermark: once
/// it has reached the tombstone's tid, the unlink is requeued `armed`,
/// and region quiescence on that second retirement guarantees every
/// reader whose snapshot predates the tombstone has finished. The armed
/// pass re-checks the tuple under its lock and unlinks; an overwritten or
/// contended tuple is simply left alone.
fn unlink_tombstone(
    tids: Arc<TidSource>,
    domain: Arc<ReclaimDomain>,
    index: Arc<OrderedIndex>,
    key: Key,
    tuple: Arc<Tuple>,
    armed: bool,
) {
    if !armed {
        let crossed = Tid::new(tids.watermark()) >= tuple.unstable_version().tid();
        let d2 = Arc::clone(&domain);
        domain.defer(move || {
            unlink_tombstone(tids, d2, index, key, tuple, crossed);
        });
        return;
    }
    let Some(word) = tuple.try_lock(true) else {
        // A committer owns it; the tombstone may be gone already anyway.
        return;
    };
    if !word.is_latest() || !tuple.latest_value_is_nil() {
        // Overwritten since retirement; nothing to unlink.
        tuple.unlock();
        return;
    }
    tuple.mark_deleting();
    let _removed = index.remove(&key);
    debug_assert!(
        _removed.as_ref().map_or(false, |t| Arc::ptr_eq(t, &tuple)),
        "tombstone unlink removed a different tuple"
    );
    trace!(key = ?key, "tombstone unlinked");
    tuple.unlock();
}
