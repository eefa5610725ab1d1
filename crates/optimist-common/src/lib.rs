//! # optimist-common
//!
//! Common types, errors, and constants for OptimistDB.
//!
//! This crate provides the foundational types used across all OptimistDB
//! components:
//!
//! - **Types**: the transaction id (`Tid`) and the variable-length byte
//!   wrappers (`Key`, `Value`)
//! - **Errors**: the abort-reason taxonomy and the unified `OptimistError`
//! - **Constants**: system-wide limits and tuning knobs
//!
//! ## Example
//!
//! ```rust
//! use optimist_common::types::{Key, Tid, Value};
//! use optimist_common::error::OptimistResult;
//!
//! fn example() -> OptimistResult<()> {
//!     let tid = Tid::new(1);
//!     let key = Key::from_bytes(b"hello");
//!     let value = Value::from_bytes(b"world");
//!     assert!(tid.is_valid() && !key.is_empty() && !value.is_empty());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod error;
pub mod types;

pub use error::{AbortReason, OptimistError, OptimistResult};
pub use types::{Key, Tid, Value};
