//! Version records.
//!
//! A [`Tuple`] is one chain of versions for one key. The chain head is the
//! only mutable link: its version word packs a spinlock bit, status flags,
//! and the tid of the last writer, and its payload is overwritten in place
//! while the superseded value is pushed onto the immutable `prev` chain.
//!
//! ```text
//! index entry ──▶ head   (tid 150, LATEST, payload "v3")
//!                   │ prev
//!                   ▼
//!                 record (tid 100, payload "v2")
//!                   │ prev
//!                   ▼
//!                 record (tid 50,  payload "v1")
//! ```
//!
//! Writers mutate the head only while holding its spinlock. Readers never
//! lock: they use the version word as a seqlock, re-reading it around the
//! payload access and retrying (or reporting instability) when it changed.
//!
//! A head whose tid is invalid has been allocated by an in-flight insert
//! and is logically absent no matter what its payload holds; this is what
//! keeps aborted inserts invisible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use optimist_common::constants::MIN_TUPLE_CAPACITY;
use optimist_common::types::Tid;

/// A tuple's packed version word.
///
/// Layout: `[LOCKED | LATEST | DELETING | MODIFYING | tid:60]`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VersionWord(u64);

impl VersionWord {
    /// Spinlock bit; set while a writer owns the head.
    pub const LOCKED: u64 = 1 << 63;
    /// Set on the one version per key the index points at.
    pub const LATEST: u64 = 1 << 62;
    /// Set once the tuple is scheduled for physical removal.
    pub const DELETING: u64 = 1 << 61;
    /// Write intent; stable readers treat it like the lock bit.
    pub const MODIFYING: u64 = 1 << 60;

    const TID_MASK: u64 = Tid::MAX.as_u64();
    const FLAG_MASK: u64 = !Self::TID_MASK;

    /// Wraps a raw word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True if the spinlock bit is set.
    #[inline]
    #[must_use]
    pub const fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    /// True if this is the latest version of its key.
    #[inline]
    #[must_use]
    pub const fn is_latest(self) -> bool {
        self.0 & Self::LATEST != 0
    }

    /// True if the tuple is scheduled for physical removal.
    #[inline]
    #[must_use]
    pub const fn is_deleting(self) -> bool {
        self.0 & Self::DELETING != 0
    }

    /// True if a writer has announced intent to mutate.
    #[inline]
    #[must_use]
    pub const fn is_modifying(self) -> bool {
        self.0 & Self::MODIFYING != 0
    }

    /// True if neither the lock nor the write-intent bit is set.
    #[inline]
    #[must_use]
    pub const fn is_stable(self) -> bool {
        self.0 & (Self::LOCKED | Self::MODIFYING) == 0
    }

    /// The tid portion of the word.
    #[inline]
    #[must_use]
    pub const fn tid(self) -> Tid {
        Tid::new(self.0 & Self::TID_MASK)
    }
}

impl std::fmt::Debug for VersionWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionWord({}", self.tid())?;
        if self.is_locked() {
            write!(f, " LOCKED")?;
        }
        if self.is_latest() {
            write!(f, " LATEST")?;
        }
        if self.is_deleting() {
            write!(f, " DELETING")?;
        }
        if self.is_modifying() {
            write!(f, " MODIFYING")?;
        }
        write!(f, ")")
    }
}

/// Result of installing a new value at a chain head.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// True if a superseded version was pushed onto the chain and is now
    /// a candidate for reclamation.
    pub spilled: bool,
    /// Set when the payload outgrew the head's capacity: a new, larger
    /// head was allocated (already locked, tagged with the commit tid, and
    /// chained to the old head). The caller must swap the index entry and
    /// unlock it.
    pub replacement: Option<Arc<Tuple>>,
}

struct TupleInner {
    data: Bytes,
    prev: Option<Arc<Tuple>>,
}

/// One chain of versions for one key.
pub struct Tuple {
    version: AtomicU64,
    capacity: usize,
    inner: RwLock<TupleInner>,
}

impl Tuple {
    /// Allocates a brand-new head for an insert path.
    ///
    /// The payload is written immediately, but the tid stays invalid until
    /// commit, which keeps the value logically absent to every reader.
    /// With `headroom` the payload buffer reserves growth room so later
    /// updates can overwrite in place.
    #[must_use]
    pub fn alloc_first(headroom: bool, data: &[u8]) -> Arc<Self> {
        let capacity = if headroom {
            (data.len() * 2).max(MIN_TUPLE_CAPACITY)
        } else {
            data.len()
        };
        Arc::new(Self {
            version: AtomicU64::new(VersionWord::LATEST),
            capacity,
            inner: RwLock::new(TupleInner {
                data: Bytes::copy_from_slice(data),
                prev: None,
            }),
        })
    }

    fn chain_record(tid: Tid, data: Bytes, prev: Option<Arc<Tuple>>) -> Arc<Self> {
        Arc::new(Self {
            version: AtomicU64::new(tid.as_u64()),
            capacity: data.len(),
            inner: RwLock::new(TupleInner { data, prev }),
        })
    }

    /// Payload capacity fixed at allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current payload length; zero is the logical tombstone.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Number of versions in this chain, head included.
    #[must_use]
    pub fn chain_len(self: &Arc<Self>) -> usize {
        let mut n = 1;
        let mut cur = self.inner.read().prev.clone();
        while let Some(t) = cur {
            n += 1;
            cur = t.inner.read().prev.clone();
        }
        n
    }

    /// Reads the version word without any stability guarantee.
    #[inline]
    #[must_use]
    pub fn unstable_version(&self) -> VersionWord {
        VersionWord(self.version.load(Ordering::Acquire))
    }

    /// Spins until the word is stable (unlocked, no write intent).
    #[must_use]
    pub fn stable_version(&self) -> VersionWord {
        loop {
            let w = self.unstable_version();
            if w.is_stable() {
                return w;
            }
            std::hint::spin_loop();
        }
    }

    /// Acquires the spinlock, returning the word observed at acquisition
    /// (lock bit set). With `write` the word also carries write intent
    /// until unlock, which stable readers observe as instability.
    pub fn lock(&self, write: bool) -> VersionWord {
        let intent = if write { VersionWord::MODIFYING } else { 0 };
        loop {
            let cur = self.version.load(Ordering::Relaxed);
            if cur & VersionWord::LOCKED == 0 {
                let next = cur | VersionWord::LOCKED | intent;
                if self
                    .version
                    .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return VersionWord(next);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Single attempt at acquiring the spinlock.
    pub fn try_lock(&self, write: bool) -> Option<VersionWord> {
        let intent = if write { VersionWord::MODIFYING } else { 0 };
        let cur = self.version.load(Ordering::Relaxed);
        if cur & VersionWord::LOCKED != 0 {
            return None;
        }
        let next = cur | VersionWord::LOCKED | intent;
        self.version
            .compare_exchange(cur, next, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| VersionWord(next))
    }

    /// Releases the spinlock and clears write intent.
    ///
    /// Idempotent: unlocking an unlocked tuple is a no-op, which keeps the
    /// abort path free to release in any order.
    pub fn unlock(&self) {
        self.version.fetch_and(
            !(VersionWord::LOCKED | VersionWord::MODIFYING),
            Ordering::Release,
        );
    }

    /// Under the caller's lock: is this still the latest version at `t`?
    #[must_use]
    pub fn is_latest_version(&self, t: Tid) -> bool {
        let w = self.unstable_version();
        w.is_latest() && w.tid() == t
    }

    /// Lock-free variant of [`is_latest_version`](Self::is_latest_version).
    ///
    /// Reports `false` when the word is unstable; validation treats that
    /// as a mismatch rather than waiting on the writer.
    #[must_use]
    pub fn stable_is_latest_version(&self, t: Tid) -> bool {
        let w = self.unstable_version();
        w.is_stable() && w.is_latest() && w.tid() == t
    }

    /// Under the caller's lock: is the latest value nil?
    ///
    /// Nil covers both the explicit tombstone (empty payload) and a head
    /// whose write never committed (invalid tid).
    #[must_use]
    pub fn latest_value_is_nil(&self) -> bool {
        let w = self.unstable_version();
        w.is_latest() && (!w.tid().is_valid() || self.inner.read().data.is_empty())
    }

    /// Lock-free variant of [`latest_value_is_nil`](Self::latest_value_is_nil).
    ///
    /// Reports `false` when the word is unstable or changed across the
    /// payload read.
    #[must_use]
    pub fn stable_latest_value_is_nil(&self) -> bool {
        let w1 = self.unstable_version();
        if !w1.is_stable() {
            return false;
        }
        let nil = !w1.tid().is_valid() || self.inner.read().data.is_empty();
        let w2 = self.unstable_version();
        w1 == w2 && w1.is_latest() && nil
    }

    /// Reads the version visible at `snapshot` (or the head if `None`).
    ///
    /// Returns the tid the caller is now bound to and the value, where
    /// `None` is a tombstone. Returns `None` overall when no version is
    /// visible: the key did not exist at the snapshot, or the head belongs
    /// to an insert that never committed.
    #[must_use]
    pub fn stable_read(&self, snapshot: Option<Tid>) -> Option<(Tid, Option<Bytes>)> {
        loop {
            let w1 = self.stable_version();
            let (data, prev) = {
                let inner = self.inner.read();
                (inner.data.clone(), inner.prev.clone())
            };
            let w2 = self.unstable_version();
            if w1 != w2 {
                continue;
            }
            let head_tid = w1.tid();
            if let Some(s) = snapshot {
                if head_tid > s {
                    return Self::read_chain(prev, s);
                }
            }
            if !head_tid.is_valid() {
                return None;
            }
            let value = if data.is_empty() { None } else { Some(data) };
            return Some((head_tid, value));
        }
    }

    /// Walks the immutable chain for the newest version at or below `s`.
    fn read_chain(mut cur: Option<Arc<Tuple>>, s: Tid) -> Option<(Tid, Option<Bytes>)> {
        while let Some(t) = cur {
            let tid = t.unstable_version().tid();
            let inner = t.inner.read();
            if tid <= s {
                if !tid.is_valid() {
                    return None;
                }
                let value = if inner.data.is_empty() {
                    None
                } else {
                    Some(inner.data.clone())
                };
                return Some((tid, value));
            }
            cur = inner.prev.clone();
        }
        None
    }

    /// Installs a new head value at `commit_tid`. Caller must hold the
    /// lock with write intent.
    ///
    /// If the new payload fits the head's capacity it is written in place
    /// and the superseded value spills onto the chain. Otherwise a larger
    /// replacement head is allocated (locked, tagged, chained to this one)
    /// and this head stops being the latest version.
    pub fn write_record_at(self: &Arc<Self>, commit_tid: Tid, bytes: &Bytes) -> WriteOutcome {
        let w = self.unstable_version();
        debug_assert!(w.is_locked() && w.is_modifying());

        if bytes.len() <= self.capacity {
            let spilled = {
                let mut inner = self.inner.write();
                // A head that never committed holds no version worth keeping.
                let spill = w.tid().is_valid();
                if spill {
                    let prev = inner.prev.take();
                    inner.prev = Some(Self::chain_record(w.tid(), inner.data.clone(), prev));
                }
                inner.data = bytes.clone();
                spill
            };
            self.set_tid(commit_tid);
            return WriteOutcome {
                spilled,
                replacement: None,
            };
        }

        let replacement = Arc::new(Self {
            version: AtomicU64::new(
                VersionWord::LOCKED
                    | VersionWord::MODIFYING
                    | VersionWord::LATEST
                    | commit_tid.as_u64(),
            ),
            capacity: bytes.len().max(self.capacity * 2),
            inner: RwLock::new(TupleInner {
                data: bytes.clone(),
                prev: Some(Arc::clone(self)),
            }),
        });
        // This head is now an interior chain record.
        self.version
            .fetch_and(!VersionWord::LATEST, Ordering::Release);
        WriteOutcome {
            spilled: true,
            replacement: Some(replacement),
        }
    }

    /// Stamps the head with a commit tid, preserving the flag bits.
    /// Caller must hold the lock.
    pub fn set_tid(&self, tid: Tid) {
        let cur = self.version.load(Ordering::Relaxed);
        debug_assert!(cur & VersionWord::LOCKED != 0);
        self.version
            .store((cur & VersionWord::FLAG_MASK) | tid.as_u64(), Ordering::Release);
    }

    /// Marks the tuple as scheduled for physical removal.
    pub fn mark_deleting(&self) {
        self.version
            .fetch_or(VersionWord::DELETING, Ordering::AcqRel);
    }

    /// Drops chain records no snapshot at or above `watermark` can reach.
    ///
    /// Keeps the newest version at or below the watermark (it is still the
    /// visible one for a snapshot equal to the watermark) and everything
    /// newer. Returns the number of records cut loose.
    pub fn prune_chain(self: &Arc<Self>, watermark: Tid) -> usize {
        let mut cur = Arc::clone(self);
        loop {
            let reached = cur.unstable_version().tid() <= watermark;
            let next = {
                let mut inner = cur.inner.write();
                if reached {
                    let dropped = inner.prev.take();
                    drop(inner);
                    let mut n = 0;
                    let mut it = dropped;
                    while let Some(t) = it {
                        n += 1;
                        it = t.inner.write().prev.take();
                    }
                    return n;
                }
                inner.prev.clone()
            };
            match next {
                Some(t) => cur = t,
                None => return 0,
            }
        }
    }
}

impl std::fmt::Debug for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuple")
            .field("version", &self.unstable_version())
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(tid: u64, data: &[u8]) -> Arc<Tuple> {
        let t = Tuple::alloc_first(true, data);
        t.lock(true);
        t.set_tid(Tid::new(tid));
        t.unlock();
        t
    }

    #[test]
    fn test_version_word_bits() {
        let w = VersionWord::from_raw(VersionWord::LATEST | 42);
        assert!(w.is_latest());
        assert!(!w.is_locked());
        assert!(w.is_stable());
        assert_eq!(w.tid(), Tid::new(42));

        let w = VersionWord::from_raw(VersionWord::LOCKED | VersionWord::DELETING | 7);
        assert!(w.is_locked());
        assert!(w.is_deleting());
        assert!(!w.is_stable());
        assert_eq!(w.tid(), Tid::new(7));
    }

    #[test]
    fn test_lock_unlock() {
        let t = Tuple::alloc_first(true, b"v");
        let w = t.lock(true);
        assert!(w.is_locked() && w.is_modifying());
        assert!(t.try_lock(false).is_none());
        t.unlock();
        assert!(t.unstable_version().is_stable());
        // Unlock is idempotent.
        t.unlock();
        assert!(t.try_lock(false).is_some());
        t.unlock();
    }

    #[test]
    fn test_fresh_tuple_is_logically_nil() {
        let t = Tuple::alloc_first(true, b"pending");
        assert!(t.latest_value_is_nil());
        assert!(t.stable_latest_value_is_nil());
        assert!(t.stable_read(None).is_none());
    }

    #[test]
    fn test_write_in_place_spills_old_version() {
        let t = committed(10, b"v1");
        t.lock(true);
        let out = t.write_record_at(Tid::new(20), &Bytes::from_static(b"v2"));
        t.unlock();

        assert!(out.spilled);
        assert!(out.replacement.is_none());
        assert_eq!(t.chain_len(), 2);

        let (tid, value) = t.stable_read(None).unwrap();
        assert_eq!(tid, Tid::new(20));
        assert_eq!(value.unwrap().as_ref(), b"v2");

        // The old version is still reachable through a snapshot.
        let (tid, value) = t.stable_read(Some(Tid::new(15))).unwrap();
        assert_eq!(tid, Tid::new(10));
        assert_eq!(value.unwrap().as_ref(), b"v1");
    }

    #[test]
    fn test_first_write_does_not_spill() {
        let t = Tuple::alloc_first(true, b"v1");
        t.lock(true);
        let out = t.write_record_at(Tid::new(5), &Bytes::from_static(b"v1"));
        t.unlock();
        assert!(!out.spilled);
        assert_eq!(t.chain_len(), 1);
    }

    #[test]
    fn test_capacity_overflow_allocates_replacement() {
        let t = committed(10, b"small");
        let big = Bytes::from(vec![b'x'; t.capacity() + 1]);

        t.lock(true);
        let out = t.write_record_at(Tid::new(20), &big);
        let repl = out.replacement.expect("payload outgrew capacity");
        assert!(out.spilled);

        let w = repl.unstable_version();
        assert!(w.is_locked() && w.is_latest());
        assert_eq!(w.tid(), Tid::new(20));
        assert!(!t.unstable_version().is_latest());
        repl.unlock();
        t.unlock();

        // The old head became the replacement's chain record.
        let (tid, value) = repl.stable_read(Some(Tid::new(12))).unwrap();
        assert_eq!(tid, Tid::new(10));
        assert_eq!(value.unwrap().as_ref(), b"small");
    }

    #[test]
    fn test_tombstone_read() {
        let t = committed(10, b"v1");
        t.lock(true);
        t.write_record_at(Tid::new(20), &Bytes::new());
        t.unlock();

        let (tid, value) = t.stable_read(None).unwrap();
        assert_eq!(tid, Tid::new(20));
        assert!(value.is_none());
        assert!(t.latest_value_is_nil());
    }

    #[test]
    fn test_snapshot_before_first_version() {
        let t = committed(10, b"v1");
        assert!(t.stable_read(Some(Tid::new(5))).is_none());
    }

    #[test]
    fn test_stable_predicates_fail_while_locked() {
        let t = committed(10, b"v1");
        assert!(t.stable_is_latest_version(Tid::new(10)));
        t.lock(true);
        assert!(!t.stable_is_latest_version(Tid::new(10)));
        assert!(!t.stable_latest_value_is_nil());
        t.unlock();
        assert!(t.stable_is_latest_version(Tid::new(10)));
    }

    #[test]
    fn test_prune_chain() {
        let t = committed(10, b"v1");
        for (tid, v) in [(20u64, "v2"), (30, "v3"), (40, "v4")] {
            t.lock(true);
            t.write_record_at(Tid::new(tid), &Bytes::copy_from_slice(v.as_bytes()));
            t.unlock();
        }
        assert_eq!(t.chain_len(), 4);

        // Watermark 30: the tid-30 record stays (visible at 30), older go.
        let cut = t.prune_chain(Tid::new(30));
        assert_eq!(cut, 2);
        assert_eq!(t.chain_len(), 2);
        let (tid, _) = t.stable_read(Some(Tid::new(35))).unwrap();
        assert_eq!(tid, Tid::new(30));
        assert!(t.stable_read(Some(Tid::new(25))).is_none());
    }

    #[test]
    fn test_prune_chain_watermark_above_head() {
        let t = committed(10, b"v1");
        t.lock(true);
        t.write_record_at(Tid::new(20), &Bytes::from_static(b"v2"));
        t.unlock();

        let cut = t.prune_chain(Tid::new(99));
        assert_eq!(cut, 1);
        assert_eq!(t.chain_len(), 1);
    }
}
