//! # optimist-txn
//!
//! The transaction object and optimistic commit protocol for OptimistDB.
//!
//! Transactions read freely and buffer writes in private per-index
//! contexts; nothing shared is mutated until commit. Commit resolves the
//! write set to tuples, locks them in sorted identity order, validates
//! everything the transaction observed (reads, absences, and scanned
//! structure), installs the new versions under a freshly minted commit
//! tid, and unlocks. Any validation failure aborts with a reason from the
//! stable taxonomy in `optimist-common`.
//!
//! Two phantom-avoidance strategies are available per transaction:
//! structural leaf-version tracking ([`TxnFlags::NODE_SCAN`]) or proven
//! absent-range tracking (the default).
//!
//! ## Example
//!
//! ```rust
//! use optimist_txn::{Store, TxnFlags};
//!
//! let store = Store::new();
//! let index = store.index("accounts");
//!
//! let mut txn = store.begin(TxnFlags::NONE);
//! txn.put(&index, "alice", "100").unwrap();
//! assert!(txn.commit(false).unwrap());
//!
//! let mut txn = store.begin(TxnFlags::NONE);
//! let value = txn.get(&index, b"alice").unwrap();
//! assert_eq!(value.as_deref(), Some(b"100".as_ref()));
//! assert!(txn.commit(false).unwrap());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commit;
mod context;
pub mod protocol;
pub mod range;
pub mod smallmap;
mod stats;
mod store;
mod transaction;

pub use protocol::{ConcurrencyControl, OccProtocol};
pub use range::{AbsentRanges, KeyRange};
pub use smallmap::SmallMap;
pub use stats::TxnStats;
pub use store::{Store, StoreConfig};
pub use transaction::{Transaction, TxnCounters, TxnFlags, TxnState};
