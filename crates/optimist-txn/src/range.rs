//! Proven-absent key ranges.
//!
//! A scanning transaction that saw an empty interval must abort if another
//! transaction later materializes a key inside it. [`AbsentRanges`] keeps
//! the intervals a transaction has proven empty as a sorted, pairwise
//! disjoint, coalesced sequence so commit-time revalidation touches each
//! interval once.

use std::fmt;

use optimist_common::types::Key;

/// A half-open key interval `[a, b)`; `b = None` leaves it open-ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub a: Key,
    /// Exclusive upper bound, or `None` for open-ended.
    pub b: Option<Key>,
}

impl KeyRange {
    /// A bounded range `[a, b)`.
    #[must_use]
    pub fn bounded(a: impl Into<Key>, b: impl Into<Key>) -> Self {
        Self {
            a: a.into(),
            b: Some(b.into()),
        }
    }

    /// An open-ended range `[a, ..)`.
    #[must_use]
    pub fn open(a: impl Into<Key>) -> Self {
        Self { a: a.into(), b: None }
    }

    /// True if the range covers no keys.
    #[must_use]
    pub fn is_empty_range(&self) -> bool {
        matches!(&self.b, Some(b) if self.a >= *b)
    }

    /// True if `key` falls inside the range.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.a.as_bytes() <= key
            && match &self.b {
                Some(b) => key < b.as_bytes(),
                None => true,
            }
    }

    /// True if `other` is fully covered by this range.
    #[must_use]
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.a <= other.a
            && match &self.b {
                None => true,
                Some(b) => matches!(&other.b, Some(ob) if ob <= b),
            }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.b {
            Some(b) => write!(f, "[{:?}, {:?})", self.a, b),
            None => write!(f, "[{:?}, ..)", self.a),
        }
    }
}

/// Sorted, disjoint, coalesced sequence of proven-absent ranges.
#[derive(Debug, Clone, Default)]
pub struct AbsentRanges {
    ranges: Vec<KeyRange>,
}

impl AbsentRanges {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True if no ranges are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates the ranges in order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    /// Index of the first range whose upper bound lies beyond `key`.
    fn lower_candidate(&self, key: &[u8]) -> usize {
        self.ranges.partition_point(|r| match &r.b {
            Some(b) => b.as_bytes() <= key,
            None => false,
        })
    }

    /// True if `key` falls in a tracked range.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        match self.ranges.get(self.lower_candidate(key)) {
            Some(r) => r.contains_key(key),
            None => false,
        }
    }

    /// Inserts a range, merging adjacent and overlapping neighbors so the
    /// sorted-disjoint invariant holds afterwards.
    pub fn add(&mut self, range: KeyRange) {
        if range.is_empty_range() {
            return;
        }

        let it = self.lower_candidate(range.a.as_bytes());
        if it == self.ranges.len() {
            // Every tracked range ends at or before the new lower bound;
            // at most the last one can be extended by adjacency.
            if let Some(last) = self.ranges.last_mut() {
                if last.b.as_ref() == Some(&range.a) {
                    last.b = range.b;
                    return;
                }
            }
            self.ranges.push(range);
            return;
        }

        if self.ranges[it].contains_range(&range) {
            return;
        }

        let merge_left = it > 0 && self.ranges[it - 1].b.as_ref() == Some(&range.a);
        let keep = if merge_left { it - 1 } else { it };
        let mut merged: Vec<KeyRange> = self.ranges[..keep].to_vec();
        let left_key = if merge_left {
            self.ranges[it - 1].a.clone()
        } else {
            self.ranges[it].a.clone().min(range.a.clone())
        };

        match &range.b {
            None => {
                // Open-ended: subsumes everything from the left key on.
                merged.push(KeyRange { a: left_key, b: None });
            }
            Some(rb) => {
                let cur = &self.ranges[it];
                let cur_subsumes = match &cur.b {
                    None => true,
                    Some(cb) => cb >= rb,
                };
                if cur_subsumes {
                    if rb < &cur.a {
                        // Disjoint: the new range sits in the gap before `cur`.
                        merged.push(KeyRange {
                            a: left_key,
                            b: Some(rb.clone()),
                        });
                        merged.extend_from_slice(&self.ranges[it..]);
                    } else {
                        merged.push(KeyRange {
                            a: left_key,
                            b: cur.b.clone(),
                        });
                        merged.extend_from_slice(&self.ranges[it + 1..]);
                    }
                } else {
                    // Walk right over ranges the new one swallows.
                    let mut i1 = it + 1;
                    while i1 < self.ranges.len() {
                        let r1 = &self.ranges[i1];
                        if r1.a >= *rb {
                            break;
                        }
                        match &r1.b {
                            None => break,
                            Some(b1) if b1 >= rb => break,
                            Some(_) => i1 += 1,
                        }
                    }
                    if i1 == self.ranges.len() {
                        merged.push(KeyRange {
                            a: left_key,
                            b: Some(rb.clone()),
                        });
                    } else if self.ranges[i1].a <= *rb {
                        merged.push(KeyRange {
                            a: left_key,
                            b: self.ranges[i1].b.clone(),
                        });
                        merged.extend_from_slice(&self.ranges[i1 + 1..]);
                    } else {
                        merged.push(KeyRange {
                            a: left_key,
                            b: Some(rb.clone()),
                        });
                        merged.extend_from_slice(&self.ranges[i1..]);
                    }
                }
            }
        }

        debug_assert!(Self::is_valid(&merged), "range set invariant broken");
        self.ranges = merged;
    }

    /// Sorted-disjoint check for debug assertions and tests.
    fn is_valid(ranges: &[KeyRange]) -> bool {
        ranges.windows(2).all(|w| match &w[0].b {
            Some(b) => b <= &w[1].a,
            None => false,
        }) && ranges.iter().all(|r| !r.is_empty_range())
    }
}
