//! The commit protocol.
//!
//! Commit runs in four phases over the per-index contexts:
//!
//! 1. **Resolve** - map every buffered write to a tuple, inserting fresh
//!    (locked) tuples for keys that take the direct insert path.
//! 2. **Lock** - sort the resolved tuples by identity and lock them in
//!    that order, then mint the commit tid. The uniform order is what
//!    makes concurrent committers deadlock-free.
//! 3. **Validate** - re-check the read set, the absent set, and whichever
//!    phantom structure the transaction used.
//! 4. **Install** - write the new versions at the commit tid and unlock.
//!
//! Any failure funnels into the abort path, which releases every held
//! lock (in any order; unlock is idempotent) and reports the reason.

use std::sync::Arc;

use tracing::{debug, trace};

use optimist_common::error::{AbortReason, OptimistError, OptimistResult};
use optimist_common::types::{Key, Tid, Value};
use optimist_index::{Leaf, OrderedIndex, RangeVisitor, Tuple};

use crate::context::{AbsentKind, NodeRef, TupleRef, TxnContext};
use crate::smallmap::SmallMap;
use crate::transaction::{Transaction, TxnFlags, TxnState};

/// One resolved write: the tuple it lands on and how to install it.
struct WriteEntry {
    tuple: Arc<Tuple>,
    index: Arc<OrderedIndex>,
    key: Key,
    value: Value,
    /// Freshly inserted by this commit; payload already written, lock
    /// already held.
    created: bool,
    locked: bool,
}

impl Transaction {
    /// Runs the commit protocol.
    ///
    /// Returns `Ok(true)` on success and on re-commit of an already
    /// committed transaction. A validation failure aborts: with
    /// `throw_on_abort` it surfaces as [`OptimistError::Aborted`],
    /// otherwise as `Ok(false)`.
    pub fn commit(&mut self, throw_on_abort: bool) -> OptimistResult<bool> {
        match self.state {
            TxnState::Embryo | TxnState::Active => {}
            TxnState::Committed => return Ok(true),
            TxnState::Aborted => {
                let reason = self.reason.unwrap_or(AbortReason::User);
                return if throw_on_abort {
                    Err(OptimistError::Aborted { reason })
                } else {
                    Ok(false)
                };
            }
        }

        let mut entries: Vec<WriteEntry> = Vec::new();
        let mut commit_tid: Option<Tid> = None;

        match self.run_phases(&mut entries, &mut commit_tid) {
            Ok(()) => {
                self.state = TxnState::Committed;
                if let Some(tid) = commit_tid {
                    self.protocol.on_tid_finish(tid);
                }
                self.stats.record_commit();
                self.stats.observe_contexts(self.contexts.values());
                self.contexts.clear();
                debug!(tid = ?commit_tid, "transaction committed");
                Ok(true)
            }
            Err(reason) => {
                for entry in &entries {
                    if entry.locked {
                        entry.tuple.unlock();
                    }
                }
                self.finish_abort(reason, commit_tid);
                if throw_on_abort {
                    Err(OptimistError::Aborted { reason })
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn run_phases(
        &mut self,
        entries: &mut Vec<WriteEntry>,
        commit_tid: &mut Option<Tid>,
    ) -> Result<(), AbortReason> {
        self.resolve_writes(entries)?;

        // A read-only transaction pinned to a consistent snapshot saw a
        // committed prefix; nothing can invalidate it.
        if self.snapshot.is_some() && entries.is_empty() {
            return Ok(());
        }

        if !entries.is_empty() {
            self.lock_writes(entries)?;
            *commit_tid = Some(self.mint_commit_tid(entries));
        }

        self.validate()?;

        if let Some(tid) = *commit_tid {
            self.install(entries, tid);
        }
        Ok(())
    }

    /// Phase 1: resolve buffered writes to tuples.
    ///
    /// Writes with the insert hint go straight to `insert_if_absent` with
    /// a freshly allocated, already locked tuple; everything else searches
    /// for the existing head. Either path may fall through to the other
    /// when it loses a race. Read-set and absent-set records for resolved
    /// keys are upgraded so validation knows we hold the lock.
    fn resolve_writes(&mut self, entries: &mut Vec<WriteEntry>) -> Result<(), AbortReason> {
        let node_mode = self.flags.contains(TxnFlags::NODE_SCAN);
        for (iref, ctx) in self.contexts.iter_mut() {
            if ctx.write_set.is_empty() {
                continue;
            }
            debug_assert!(!self.flags.contains(TxnFlags::READ_ONLY));
            let index = &iref.0;

            let write_set: Vec<(Key, Value, bool)> = ctx
                .write_set
                .iter()
                .map(|(k, w)| (k.clone(), w.value.clone(), w.insert))
                .collect();

            for (key, value, insert_hint) in write_set {
                let mut try_insert = insert_hint;
                loop {
                    if !try_insert {
                        if let Some(tuple) = index.search(&key) {
                            trace!(key = ?key, "write target found by search");
                            Self::mark_write_target(ctx, &tuple, &key, false);
                            entries.push(WriteEntry {
                                tuple,
                                index: Arc::clone(index),
                                key,
                                value,
                                created: false,
                                locked: false,
                            });
                            break;
                        }
                        self.stats.bump(&self.stats.write_search_failed);
                        try_insert = true;
                        continue;
                    }

                    let fresh = Tuple::alloc_first(true, &value);
                    fresh.lock(true);
                    match index.insert_if_absent(key.clone(), Arc::clone(&fresh)) {
                        Ok(info) => {
                            trace!(key = ?key, leaf = info.leaf.id(), "write target inserted");
                            entries.push(WriteEntry {
                                tuple: Arc::clone(&fresh),
                                index: Arc::clone(index),
                                key: key.clone(),
                                value,
                                created: true,
                                locked: true,
                            });
                            if node_mode {
                                Self::recheck_scanned_leaf(ctx, &info.leaf, info.version)?;
                            }
                            Self::mark_write_target(ctx, &fresh, &key, true);
                            break;
                        }
                        Err(_existing) => {
                            fresh.unlock();
                            self.stats.bump(&self.stats.write_insert_failed);
                            try_insert = false;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Upgrades read/absent records for a key this commit will lock.
    fn mark_write_target(ctx: &mut TxnContext, tuple: &Arc<Tuple>, key: &Key, created: bool) {
        if let Some(read) = ctx.read_set.get_mut(&TupleRef(Arc::clone(tuple))) {
            debug_assert!(!read.holds_lock);
            read.holds_lock = true;
        }
        if ctx.absent_set.is_empty() {
            return;
        }
        if let Some(absent) = ctx.absent_set.get_mut(key) {
            debug_assert_eq!(absent.kind, AbsentKind::Read);
            absent.kind = if created {
                AbsentKind::Insert
            } else {
                AbsentKind::Write
            };
            absent.tuple = Some(Arc::clone(tuple));
        }
    }

    /// After a fresh insert under node-scan tracking: the landing leaf
    /// must still be at its recorded version, which then advances by one
    /// for our own insert.
    fn recheck_scanned_leaf(
        ctx: &mut TxnContext,
        leaf: &Arc<Leaf>,
        observed: u64,
    ) -> Result<(), AbortReason> {
        if let Some(recorded) = ctx.node_scan.get_mut(&NodeRef(Arc::clone(leaf))) {
            if *recorded != observed {
                return Err(AbortReason::WriteNodeInterference);
            }
            // Wrap-around of the 64-bit counter is out of scope.
            *recorded = observed + 1;
        }
        Ok(())
    }

    /// Phase 2: lock the resolved tuples in sorted identity order.
    ///
    /// Tuples created by the insert path already hold their lock and keep
    /// their slot in the order. A target that was deleted, superseded, or
    /// rewritten past this transaction's begin point aborts.
    fn lock_writes(&mut self, entries: &mut [WriteEntry]) -> Result<(), AbortReason> {
        entries.sort_by_key(|e| Arc::as_ptr(&e.tuple) as usize);
        for entry in entries.iter_mut() {
            if entry.locked {
                continue;
            }
            let word = entry.tuple.lock(true);
            entry.locked = true;
            if word.is_deleting()
                || !word.is_latest()
                || !self.protocol.can_read_tid(word.tid(), self.begin_tid)
            {
                trace!(key = ?entry.key, word = ?word, "write target interfered");
                return Err(AbortReason::WriteNodeInterference);
            }
        }
        Ok(())
    }

    /// Mints the commit tid over everything this transaction observed.
    fn mint_commit_tid(&self, entries: &[WriteEntry]) -> Tid {
        let mut observed = Tid::INVALID;
        for ctx in self.contexts.values() {
            for (_, read) in ctx.read_set.iter() {
                observed = observed.max(read.t);
            }
        }
        let locked: Vec<Arc<Tuple>> = entries.iter().map(|e| Arc::clone(&e.tuple)).collect();
        self.protocol.gen_commit_tid(&locked, observed)
    }

    /// Phase 3: validation.
    fn validate(&self) -> Result<(), AbortReason> {
        let node_mode = self.flags.contains(TxnFlags::NODE_SCAN);
        for (iref, ctx) in self.contexts.iter() {
            self.validate_read_set(ctx)?;
            self.validate_absent_set(&iref.0, ctx)?;
            if node_mode {
                debug_assert!(ctx.absent_ranges.is_empty());
                Self::validate_node_scan(ctx)?;
            } else {
                debug_assert!(ctx.node_scan.is_empty());
                Self::validate_absent_ranges(&iref.0, ctx)?;
            }
        }
        Ok(())
    }

    /// Every tuple we read must still be the latest version at the tid we
    /// observed.
    fn validate_read_set(&self, ctx: &TxnContext) -> Result<(), AbortReason> {
        for (tref, read) in ctx.read_set.iter() {
            let ok = if read.holds_lock {
                tref.0.is_latest_version(read.t)
            } else {
                tref.0.stable_is_latest_version(read.t)
            };
            if !ok {
                trace!(observed = %read.t, "read-set tuple invalidated");
                return Err(AbortReason::ReadNodeInterference);
            }
        }
        Ok(())
    }

    /// Every key we read as absent must still read as absent.
    fn validate_absent_set(
        &self,
        index: &Arc<OrderedIndex>,
        ctx: &TxnContext,
    ) -> Result<(), AbortReason> {
        for (key, absent) in ctx.absent_set.iter() {
            match absent.kind {
                // By inserting we guaranteed the key did not exist.
                AbsentKind::Insert => continue,
                AbsentKind::Write => {
                    let tuple = absent
                        .tuple
                        .as_ref()
                        .expect("write-kind absent record carries its tuple");
                    if !tuple.latest_value_is_nil() {
                        trace!(key = ?key, "absent write target became visible");
                        return Err(AbortReason::ReadAbsenceInterference);
                    }
                }
                AbsentKind::Read => {
                    debug_assert!(absent.tuple.is_none());
                    if let Some(tuple) = index.search(key) {
                        if !tuple.stable_latest_value_is_nil() {
                            trace!(key = ?key, "absent key materialized");
                            return Err(AbortReason::ReadAbsenceInterference);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Every leaf we scanned must still be at the version we recorded.
    fn validate_node_scan(ctx: &TxnContext) -> Result<(), AbortReason> {
        for (node, recorded) in ctx.node_scan.iter() {
            let current = node.0.version_number();
            if current != *recorded {
                trace!(
                    leaf = node.0.id(),
                    recorded,
                    current,
                    "scanned leaf changed"
                );
                return Err(AbortReason::NodeScanVersionChanged);
            }
        }
        Ok(())
    }

    /// Every proven-absent range must still hold nothing visible beyond
    /// this transaction's own writes.
    fn validate_absent_ranges(
        index: &Arc<OrderedIndex>,
        ctx: &TxnContext,
    ) -> Result<(), AbortReason> {
        for range in ctx.absent_ranges.iter() {
            let mut validator = AbsentRangeValidator {
                write_set: &ctx.write_set,
                failed: false,
            };
            index.search_range_call(
                range.a.as_bytes(),
                range.b.as_ref().map(|b| b.as_bytes()),
                &mut validator,
            );
            if validator.failed {
                trace!(range = %range, "absent range interfered");
                return Err(AbortReason::WriteNodeInterference);
            }
        }
        Ok(())
    }

    /// Phase 4: install the new versions and unlock, in the same sorted
    /// order the locks were taken in.
    fn install(&self, entries: &[WriteEntry], tid: Tid) {
        for entry in entries {
            debug_assert!(entry.locked);
            if entry.created {
                // Payload was written at allocation; stamping the tid
                // makes it visible.
                entry.tuple.set_tid(tid);
            } else {
                let outcome = entry.tuple.write_record_at(tid, entry.value.as_raw());
                let latest = match outcome.replacement {
                    Some(ref replacement) => {
                        // The head outgrew its buffer: swap the index entry
                        // to the new head.
                        let _old = entry.index.insert(entry.key.clone(), Arc::clone(replacement));
                        debug_assert!(
                            _old.as_ref().map_or(false, |t| Arc::ptr_eq(t, &entry.tuple)),
                            "replaced entry was not the locked head"
                        );
                        self.stats.bump(&self.stats.latest_replacements);
                        Arc::clone(replacement)
                    }
                    None => Arc::clone(&entry.tuple),
                };
                if outcome.spilled {
                    self.protocol.on_tuple_spill(&entry.index, &entry.key, &latest);
                }
                if entry.value.is_empty() {
                    self.protocol
                        .on_logical_delete(&entry.index, &entry.key, &latest);
                }
                if let Some(replacement) = outcome.replacement {
                    replacement.unlock();
                }
            }
            entry.tuple.unlock();
        }
    }
}

/// Fails when a proven-absent range contains a visible key this
/// transaction did not write itself.
struct AbsentRangeValidator<'a> {
    write_set: &'a SmallMap<Key, crate::context::WriteRecord>,
    failed: bool,
}

impl RangeVisitor for AbsentRangeValidator<'_> {
    fn visit(&mut self, key: &Key, tuple: &Arc<Tuple>) -> bool {
        if self.write_set.contains_key(key) {
            return true;
        }
        if tuple.stable_latest_value_is_nil() {
            return true;
        }
        self.failed = true;
        false
    }
}
