//! # optimist-reclaim
//!
//! Region-based quiescent reclamation for OptimistDB.
//!
//! Shared tuples are referenced by concurrent readers that hold no locks,
//! so superseded versions and logically deleted index entries cannot be
//! torn down the moment they are retired. This crate defers that work
//! until it is provably unobservable:
//!
//! 1. A thread enters a [`Region`] when its transaction starts and leaves
//!    it (by dropping the guard) when the transaction resolves.
//! 2. Cleanup work retired through [`ReclaimDomain::defer`] is stamped with
//!    the epoch at retirement.
//! 3. A deferred callback runs only once every region that was open at its
//!    retirement epoch has closed.
//!
//! Collection is cooperative: leaving a region drains a bounded batch of
//! ready callbacks, and [`ReclaimDomain::collect`] can be called explicitly.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use optimist_common::constants::RECLAIM_BATCH;

/// A deferred cleanup callback with its retirement epoch.
struct Deferred {
    epoch: u64,
    run: Box<dyn FnOnce() + Send>,
}

/// Statistics about a reclamation domain.
#[derive(Debug, Default)]
pub struct ReclaimStats {
    /// Callbacks retired through `defer`.
    pub deferred: AtomicU64,
    /// Callbacks executed.
    pub collected: AtomicU64,
    /// Collect passes that ran at least one callback.
    pub runs: AtomicU64,
}

impl ReclaimStats {
    /// Total callbacks retired.
    pub fn total_deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Total callbacks executed.
    pub fn total_collected(&self) -> u64 {
        self.collected.load(Ordering::Relaxed)
    }
}

/// Tracks open regions and defers cleanup until quiescence.
pub struct ReclaimDomain {
    /// Advances on every retirement so later regions are distinguishable
    /// from regions open at retirement time.
    epoch: AtomicU64,
    /// Entry epoch of every open region, keyed by region id.
    regions: Mutex<BTreeMap<u64, u64>>,
    next_region_id: AtomicU64,
    /// Retired callbacks in stamp order.
    queue: Mutex<VecDeque<Deferred>>,
    stats: ReclaimStats,
}

impl ReclaimDomain {
    /// Creates a new, empty domain.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: AtomicU64::new(0),
            regions: Mutex::new(BTreeMap::new()),
            next_region_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            stats: ReclaimStats::default(),
        })
    }

    /// Opens a region pinned at the current epoch.
    ///
    /// Everything retired while the region is open stays alive until the
    /// region closes.
    pub fn enter(self: &Arc<Self>) -> Region {
        let epoch = self.epoch.load(Ordering::Acquire);
        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().insert(id, epoch);
        Region {
            domain: Arc::clone(self),
            id,
            epoch,
        }
    }

    /// Retires a cleanup callback.
    ///
    /// The callback runs during a later collect, once every region open at
    /// this call has closed.
    pub fn defer(&self, run: impl FnOnce() + Send + 'static) {
        let stamp = self.epoch.fetch_add(1, Ordering::AcqRel);
        self.queue.lock().push_back(Deferred {
            epoch: stamp,
            run: Box::new(run),
        });
        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs ready callbacks, at most [`RECLAIM_BATCH`] of them.
    ///
    /// Returns the number of callbacks executed.
    pub fn collect(&self) -> usize {
        let min_open = self.regions.lock().values().min().copied();
        let mut ready = Vec::new();
        {
            let mut queue = self.queue.lock();
            while ready.len() < RECLAIM_BATCH {
                let safe = match (queue.front(), min_open) {
                    (Some(d), Some(m)) => d.epoch < m,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if !safe {
                    break;
                }
                ready.push(queue.pop_front().expect("front checked"));
            }
        }
        let n = ready.len();
        for d in ready {
            (d.run)();
        }
        if n > 0 {
            self.stats.collected.fetch_add(n as u64, Ordering::Relaxed);
            self.stats.runs.fetch_add(1, Ordering::Relaxed);
            debug!(collected = n, "reclaim collect");
        }
        n
    }

    /// Drains every ready callback regardless of batch size.
    ///
    /// Returns the total number of callbacks executed.
    pub fn collect_all(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.collect();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Number of currently open regions.
    pub fn open_regions(&self) -> usize {
        self.regions.lock().len()
    }

    /// Number of callbacks waiting for quiescence.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns reclamation statistics.
    pub fn stats(&self) -> &ReclaimStats {
        &self.stats
    }

    fn leave(&self, id: u64) {
        self.regions.lock().remove(&id);
        self.collect();
    }
}

impl fmt::Debug for ReclaimDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimDomain")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("open_regions", &self.open_regions())
            .field("pending", &self.pending())
            .finish()
    }
}

/// RAII guard for an open reclamation region.
///
/// Dropping the guard closes the region and opportunistically collects.
pub struct Region {
    domain: Arc<ReclaimDomain>,
    id: u64,
    epoch: u64,
}

impl Region {
    /// The epoch this region was pinned at.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.domain.leave(self.id);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .finish()
    }
}
