//! The transaction object.
//!
//! A [`Transaction`] buffers every operation in per-index contexts and
//! mutates nothing shared until commit. The lifecycle:
//!
//! ```text
//! ┌────────┐  first op   ┌────────┐  commit ok   ┌───────────┐
//! │ Embryo │────────────▶│ Active │─────────────▶│ Committed │
//! └────────┘             └────────┘              └───────────┘
//!                             │  validation failure / abort()
//!                             ▼
//!                        ┌─────────┐
//!                        │ Aborted │
//!                        └─────────┘
//! ```
//!
//! Committed and Aborted are terminal; operating on a terminal
//! transaction fails with [`OptimistError::Unusable`]. Each transaction
//! runs on exactly one thread and owns its contexts outright.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use optimist_common::constants::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use optimist_common::error::{AbortReason, OptimistError, OptimistResult};
use optimist_common::types::{Key, Tid, Value};
use optimist_index::{Leaf, OrderedIndex, RangeVisitor, Tuple};
use optimist_reclaim::Region;

use crate::context::TxnContext;
use crate::protocol::ConcurrencyControl;
use crate::range::KeyRange;
use crate::stats::TxnStats;

/// Transaction flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnFlags(u64);

impl TxnFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The transaction promises not to write. With a consistent snapshot
    /// available it never locks and never aborts.
    pub const READ_ONLY: Self = Self(1 << 0);
    /// Track phantoms through index leaf versions instead of absent
    /// ranges.
    pub const NODE_SCAN: Self = Self(1 << 1);

    /// Checks if all flags in `other` are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns the union of two flag sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for TxnFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.union(other)
    }
}

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Created, no operation yet.
    Embryo,
    /// At least one operation performed.
    Active,
    /// Terminal: commit succeeded.
    Committed,
    /// Terminal: validation failed or the caller aborted.
    Aborted,
}

impl TxnState {
    /// True for the terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            TxnState::Embryo => "Embryo",
            TxnState::Active => "Active",
            TxnState::Committed => "Committed",
            TxnState::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index identity for the context map: pointer equality on the shared
/// index.
#[derive(Clone)]
pub(crate) struct IndexRef(pub(crate) Arc<OrderedIndex>);

impl PartialEq for IndexRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for IndexRef {}

impl std::hash::Hash for IndexRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Point-in-time sizes of a transaction's tracking structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnCounters {
    /// Per-index contexts in use.
    pub contexts: usize,
    /// Largest read set across contexts.
    pub max_read_set: usize,
    /// Largest absent set across contexts.
    pub max_absent_set: usize,
    /// Largest write set across contexts.
    pub max_write_set: usize,
    /// Largest node-scan set across contexts.
    pub max_node_scan: usize,
    /// Largest absent-range count across contexts.
    pub max_absent_ranges: usize,
}

/// An optimistic transaction over one or more ordered indexes.
pub struct Transaction {
    pub(crate) state: TxnState,
    pub(crate) flags: TxnFlags,
    pub(crate) reason: Option<AbortReason>,
    /// Pinned snapshot for read-only transactions, when available.
    pub(crate) snapshot: Option<Tid>,
    /// Newest tid issued when this transaction began; versions beyond it
    /// are not overwritable by this transaction.
    pub(crate) begin_tid: Tid,
    pub(crate) contexts: HashMap<IndexRef, TxnContext>,
    pub(crate) protocol: Arc<dyn ConcurrencyControl>,
    pub(crate) stats: Arc<TxnStats>,
    _region: Region,
}

impl Transaction {
    /// Creates a transaction bound to `protocol`, pinned inside `region`.
    ///
    /// Usually called through `Store::begin`.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn ConcurrencyControl>,
        stats: Arc<TxnStats>,
        flags: TxnFlags,
        region: Region,
    ) -> Self {
        let snapshot = if flags.contains(TxnFlags::READ_ONLY) {
            protocol.consistent_snapshot_tid()
        } else {
            None
        };
        let begin_tid = protocol.begin_tid();
        Self {
            state: TxnState::Embryo,
            flags,
            reason: None,
            snapshot,
            begin_tid,
            contexts: HashMap::new(),
            protocol,
            stats,
            _region: region,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Flags the transaction was created with.
    #[must_use]
    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// Why the transaction aborted, once it has.
    #[must_use]
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.reason
    }

    /// The snapshot tid pinned at begin, for read-only transactions.
    #[must_use]
    pub fn snapshot_tid(&self) -> Option<Tid> {
        self.snapshot
    }

    /// Sizes of this transaction's tracking structures.
    #[must_use]
    pub fn counters(&self) -> TxnCounters {
        let mut counters = TxnCounters::default();
        for ctx in self.contexts.values() {
            counters.contexts += 1;
            counters.max_read_set = counters.max_read_set.max(ctx.read_set.len());
            counters.max_absent_set = counters.max_absent_set.max(ctx.absent_set.len());
            counters.max_write_set = counters.max_write_set.max(ctx.write_set.len());
            counters.max_node_scan = counters.max_node_scan.max(ctx.node_scan.len());
            counters.max_absent_ranges =
                counters.max_absent_ranges.max(ctx.absent_ranges.len());
        }
        counters
    }

    fn ensure_usable(&mut self) -> OptimistResult<()> {
        match self.state {
            TxnState::Embryo => {
                self.state = TxnState::Active;
                Ok(())
            }
            TxnState::Active => Ok(()),
            state => Err(OptimistError::Unusable { state: state.name() }),
        }
    }

    fn check_key(key: &[u8]) -> OptimistResult<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(OptimistError::KeyTooLarge {
                size: key.len(),
                limit: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }

    fn check_value(value: &Value) -> OptimistResult<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(OptimistError::ValueTooLarge {
                size: value.len(),
                limit: MAX_VALUE_SIZE,
            });
        }
        Ok(())
    }

    fn context(&mut self, index: &Arc<OrderedIndex>) -> &mut TxnContext {
        self.contexts
            .entry(IndexRef(Arc::clone(index)))
            .or_default()
    }

    /// Reads the value visible to this transaction for `key`.
    ///
    /// Locally buffered writes win, then locally proven absences; only
    /// then is the index consulted, binding this transaction to the
    /// version it observed.
    pub fn get(
        &mut self,
        index: &Arc<OrderedIndex>,
        key: &[u8],
    ) -> OptimistResult<Option<Value>> {
        self.ensure_usable()?;
        Self::check_key(key)?;

        let range_tracking = !self.flags.contains(TxnFlags::NODE_SCAN);
        let snapshot = self.snapshot;
        let stats = Arc::clone(&self.stats);
        let ctx = self.context(index);

        stats.bump(&stats.local_lookups);
        if let Some(local) = ctx.local_search(key, range_tracking, &stats) {
            return Ok(local);
        }

        match index.search(key) {
            Some(tuple) => match tuple.stable_read(snapshot) {
                Some((t, value)) => {
                    ctx.record_read(tuple, t);
                    Ok(value.map(Value::from_raw))
                }
                None => {
                    ctx.record_absent_read(Key::from_bytes(key));
                    Ok(None)
                }
            },
            None => {
                ctx.record_absent_read(Key::from_bytes(key));
                Ok(None)
            }
        }
    }

    /// Buffers a write of `value` under `key`.
    pub fn put(
        &mut self,
        index: &Arc<OrderedIndex>,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> OptimistResult<()> {
        self.write_record(index, key.into(), value.into(), false)
    }

    /// Buffers a write with the insert hint: commit tries the direct
    /// insert-if-absent path first.
    pub fn insert(
        &mut self,
        index: &Arc<OrderedIndex>,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> OptimistResult<()> {
        self.write_record(index, key.into(), value.into(), true)
    }

    /// Buffers a delete of `key` (an empty-payload write).
    pub fn remove(&mut self, index: &Arc<OrderedIndex>, key: impl Into<Key>) -> OptimistResult<()> {
        self.write_record(index, key.into(), Value::empty(), false)
    }

    fn write_record(
        &mut self,
        index: &Arc<OrderedIndex>,
        key: Key,
        value: Value,
        insert: bool,
    ) -> OptimistResult<()> {
        self.ensure_usable()?;
        Self::check_key(&key)?;
        Self::check_value(&value)?;
        if self.flags.contains(TxnFlags::READ_ONLY) {
            return Err(OptimistError::internal(
                "write issued on a read-only transaction",
            ));
        }
        self.context(index).record_write(key, value, insert);
        Ok(())
    }

    /// Visits every visible key in `[lo, hi)` in order. The visitor
    /// returns `false` to halt the scan. An absent `hi` scans to the end.
    ///
    /// What the scan proves empty is tracked for commit-time phantom
    /// validation: through leaf versions under [`TxnFlags::NODE_SCAN`],
    /// through absent ranges otherwise.
    pub fn scan(
        &mut self,
        index: &Arc<OrderedIndex>,
        lo: &[u8],
        hi: Option<&[u8]>,
        visitor: &mut dyn FnMut(&Key, &Value) -> bool,
    ) -> OptimistResult<()> {
        self.ensure_usable()?;
        Self::check_key(lo)?;
        if let Some(hi) = hi {
            Self::check_key(hi)?;
        }

        let node_mode = self.flags.contains(TxnFlags::NODE_SCAN);
        let snapshot = self.snapshot;
        let ctx = self.context(index);

        let mut driver = ScanDriver {
            ctx,
            snapshot,
            node_mode,
            user: visitor,
            gap_start: Key::from_bytes(lo),
            halted: false,
        };
        index.search_range_call(lo, hi, &mut driver);
        let (gap_start, halted) = (driver.gap_start, driver.halted);

        if !node_mode && !halted {
            // The tail past the last bound key was proven empty too.
            self.context(index).absent_ranges.add(KeyRange {
                a: gap_start,
                b: hi.map(Key::from_bytes),
            });
        }
        Ok(())
    }

    /// Explicitly aborts the transaction.
    ///
    /// Idempotent on an already aborted transaction; aborting a committed
    /// one fails with [`OptimistError::Unusable`].
    pub fn abort(&mut self) -> OptimistResult<()> {
        match self.state {
            TxnState::Embryo | TxnState::Active => {
                self.finish_abort(AbortReason::User, None);
                Ok(())
            }
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(OptimistError::Unusable {
                state: TxnState::Committed.name(),
            }),
        }
    }

    pub(crate) fn finish_abort(&mut self, reason: AbortReason, commit_tid: Option<Tid>) {
        self.state = TxnState::Aborted;
        self.reason = Some(reason);
        if let Some(tid) = commit_tid {
            self.protocol.on_tid_finish(tid);
        }
        self.stats.record_abort(reason);
        self.stats.observe_contexts(self.contexts.values());
        self.contexts.clear();
        tracing::debug!(reason = %reason, "transaction aborted");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Transaction");
        s.field("state", &self.state)
            .field("flags", &self.flags)
            .field("reason", &self.reason)
            .field("snapshot", &self.snapshot);
        for (i, ctx) in self.contexts.values().enumerate() {
            s.field(&format!("context[{}]", i), ctx);
        }
        s.finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A transaction must be resolved before it goes out of scope.
        if self.state == TxnState::Active {
            self.finish_abort(AbortReason::User, None);
            if !std::thread::panicking() {
                debug_assert!(false, "transaction dropped while active");
            }
        }
    }
}

/// Bridges the index range scan onto the transaction's bookkeeping.
///
/// Keys bound through the read set close the running proven-empty gap;
/// everything between them stays inside it. Keys covered by the local
/// write set need no absence proof (validation excuses them), and keys
/// with nothing visible stay in the gap so a later commit there is caught.
struct ScanDriver<'a> {
    ctx: &'a mut TxnContext,
    snapshot: Option<Tid>,
    node_mode: bool,
    user: &'a mut dyn FnMut(&Key, &Value) -> bool,
    /// Lower bound of the interval proven empty since the last bound key.
    gap_start: Key,
    halted: bool,
}

impl ScanDriver<'_> {
    /// Records `[gap_start, end)` as proven empty.
    fn flush_gap(&mut self, end: &Key) {
        if !self.node_mode {
            self.ctx.absent_ranges.add(KeyRange {
                a: self.gap_start.clone(),
                b: Some(end.clone()),
            });
        }
    }
}

impl RangeVisitor for ScanDriver<'_> {
    fn visit_node(&mut self, leaf: &Arc<Leaf>, version: u64) -> bool {
        if self.node_mode {
            self.ctx.record_node(Arc::clone(leaf), version);
        }
        true
    }

    fn visit(&mut self, key: &Key, tuple: &Arc<Tuple>) -> bool {
        // A locally buffered write shadows the shared version.
        let local = self.ctx.write_set.get(key).map(|w| w.value.clone());
        let deliver = if let Some(value) = local {
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        } else {
            match tuple.stable_read(self.snapshot) {
                Some((t, value)) => {
                    self.ctx.record_read(Arc::clone(tuple), t);
                    // The read set now guards this key; the gap resumes
                    // past it.
                    self.flush_gap(key);
                    self.gap_start = key.successor();
                    value.map(Value::from_raw)
                }
                // Nothing visible here: an uncommitted insert or a
                // version newer than the snapshot. Stays in the gap.
                None => None,
            }
        };

        if let Some(value) = deliver {
            if !(self.user)(key, &value) {
                // The emptiness up to this key was exposed to the caller
                // and must still be validated.
                self.flush_gap(key);
                self.halted = true;
                return false;
            }
        }
        true
    }
}
