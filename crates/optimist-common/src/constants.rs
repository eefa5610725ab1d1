//! System-wide constants for OptimistDB.

// =============================================================================
// Transaction id layout
// =============================================================================

/// Number of bits of the tuple version word that carry the transaction id.
///
/// The top four bits are reserved for the lock, latest, deleting, and
/// modifying flags.
pub const TID_BITS: u32 = 60;

// =============================================================================
// Key and value limits
// =============================================================================

/// Maximum key size in bytes (16 KB).
pub const MAX_KEY_SIZE: usize = 16 * 1024;

/// Maximum value size in bytes (1 MB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Index tuning
// =============================================================================

/// Default number of entries per index leaf before it splits.
pub const DEFAULT_LEAF_FANOUT: usize = 16;

/// Smallest payload capacity reserved for a freshly allocated tuple.
///
/// Allocating with headroom lets most updates overwrite in place instead of
/// replacing the head of the version chain.
pub const MIN_TUPLE_CAPACITY: usize = 32;

// =============================================================================
// Transaction-context tuning
// =============================================================================

/// Number of entries a per-transaction set keeps inline before it promotes
/// itself to a hash map. Most transactions touch only a handful of keys.
pub const SMALL_MAP_INLINE: usize = 8;

// =============================================================================
// Reclamation tuning
// =============================================================================

/// Maximum number of deferred callbacks executed per cooperative collect.
pub const RECLAIM_BATCH: usize = 64;
