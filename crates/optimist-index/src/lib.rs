//! # optimist-index
//!
//! Version records and the concurrent ordered index for OptimistDB.
//!
//! This crate implements the two shared data structures the transaction
//! core operates on:
//!
//! - [`Tuple`]: a heap-allocated version record. The head of each chain
//!   carries a version word (spinlock bit, status flags, and the tid of the
//!   writing transaction) plus the current payload; older versions hang off
//!   an immutable `prev` chain, newest first.
//! - [`OrderedIndex`]: an ordered map from byte keys to tuple heads,
//!   organized as a sorted directory of leaf pages. Every leaf has a stable
//!   identity and a structural version counter that observably changes
//!   whenever the leaf's key membership changes - the hook scan validation
//!   builds on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tree;
pub mod tuple;

pub use tree::{InsertInfo, Leaf, OrderedIndex, RangeVisitor};
pub use tuple::{Tuple, VersionWord, WriteOutcome};
