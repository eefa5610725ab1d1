//! Identifier types for OptimistDB.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different id kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::TID_BITS;

/// Transaction identifier.
///
/// Tids are minted at commit and are monotonically increasing. A tid both
/// names a committed transaction and tags every tuple version that
/// transaction wrote. Only [`TID_BITS`] bits are usable; the remainder of
/// the tuple version word carries status flags.
///
/// # Example
///
/// ```rust
/// use optimist_common::types::Tid;
///
/// let tid = Tid::new(1);
/// assert!(tid.is_valid());
/// assert!(!Tid::INVALID.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Tid(u64);

impl Tid {
    /// Invalid tid, used as a sentinel for never-committed versions.
    pub const INVALID: Self = Self(0);

    /// Minimum valid tid.
    pub const MIN: Self = Self(1);

    /// Maximum tid representable in a tuple version word.
    pub const MAX: Self = Self((1 << TID_BITS) - 1);

    /// Creates a new `Tid` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next tid.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid tid.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the larger of two tids.
    #[inline]
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Tid(INVALID)")
        } else {
            write!(f, "Tid({})", self.0)
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<Tid> for u64 {
    #[inline]
    fn from(id: Tid) -> Self {
        id.0
    }
}
