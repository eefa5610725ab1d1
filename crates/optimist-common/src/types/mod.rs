//! Core types for OptimistDB.

mod ids;
mod keys;

pub use ids::Tid;
pub use keys::{Key, Value};
