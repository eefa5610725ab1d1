//! Error handling for OptimistDB.
//!
//! Aborts are values, not unwinding: the commit path threads an
//! [`AbortReason`] internally and only surfaces it as an [`OptimistError`]
//! at the caller's request. `Internal` errors indicate bugs and are never
//! recoverable.

use std::fmt;
use thiserror::Error;

/// Why a transaction aborted.
///
/// Every abort carries exactly one reason; the reason taxonomy is stable
/// and feeds the per-reason counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The caller aborted explicitly.
    User,
    /// A write target was stolen or deleted between read and lock, a
    /// scanned node changed under a concurrent insert, or absent-range
    /// validation found an interfering key.
    WriteNodeInterference,
    /// A read-set tuple is no longer the latest version at the observed
    /// tid.
    ReadNodeInterference,
    /// A key that was read as absent now exists with a non-nil value.
    ReadAbsenceInterference,
    /// A scanned index node's version changed before commit.
    NodeScanVersionChanged,
}

impl AbortReason {
    /// Returns a stable short name for logging and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AbortReason::User => "user",
            AbortReason::WriteNodeInterference => "write_node_interference",
            AbortReason::ReadNodeInterference => "read_node_interference",
            AbortReason::ReadAbsenceInterference => "read_absence_interference",
            AbortReason::NodeScanVersionChanged => "node_scan_version_changed",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for OptimistDB.
#[derive(Debug, Error)]
pub enum OptimistError {
    /// The transaction aborted; the reason says why.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Why the transaction aborted.
        reason: AbortReason,
    },

    /// An operation was attempted on a transaction in a terminal state.
    #[error("transaction is unusable in state {state}")]
    Unusable {
        /// The terminal state the transaction is in.
        state: &'static str,
    },

    /// A key exceeded the maximum allowed size.
    #[error("key of {size} bytes exceeds the limit of {limit}")]
    KeyTooLarge {
        /// Offending key size.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// A value exceeded the maximum allowed size.
    #[error("value of {size} bytes exceeds the limit of {limit}")]
    ValueTooLarge {
        /// Offending value size.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl OptimistError {
    /// Shorthand for building an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        OptimistError::Internal {
            message: message.into(),
        }
    }

    /// Returns the abort reason if this error is an abort.
    #[must_use]
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            OptimistError::Aborted { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type alias for OptimistDB operations.
pub type OptimistResult<T> = std::result::Result<T, OptimistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_reason_names() {
        assert_eq!(AbortReason::User.as_str(), "user");
        assert_eq!(
            AbortReason::NodeScanVersionChanged.to_string(),
            "node_scan_version_changed"
        );
    }

    #[test]
    fn test_error_display() {
        let err = OptimistError::Aborted {
            reason: AbortReason::ReadNodeInterference,
        };
        assert_eq!(
            err.to_string(),
            "transaction aborted: read_node_interference"
        );
        assert_eq!(err.abort_reason(), Some(AbortReason::ReadNodeInterference));

        let err = OptimistError::Unusable { state: "Committed" };
        assert!(err.to_string().contains("Committed"));
        assert_eq!(err.abort_reason(), None);
    }

    #[test]
    fn test_internal_helper() {
        let err = OptimistError::internal("oops");
        assert_eq!(err.to_string(), "internal error: oops");
    }
}
