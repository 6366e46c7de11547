//! Classified refresh error model.
//!
//! [`RefreshError`] carries the error kind the executor matches on for
//! retry and status decisions, plus a stable code for history records.
//! Construct via the kind-specific factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a refresh error.
///
/// Determines retry behavior and how the failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The definition itself is at fault: unparseable query, missing
    /// source, invariant violation. Never retried; the table enters
    /// `failed` until the definition changes.
    Definitional,
    /// Transient lake failure: connection loss, conflict, statement
    /// timeout. Retried with backoff within the attempt.
    TransientLake,
    /// Memory or temp-space exhaustion. Fails the attempt; not retried
    /// automatically.
    Resource,
    /// Claim lost, heartbeat write failed, subtask timed out. Handled by
    /// the sweeper and re-queueing rather than surfaced as a hard failure.
    Coordination,
    /// Unclassifiable internal failure.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Definitional => "definitional",
            Self::TransientLake => "transient_lake",
            Self::Resource => "resource",
            Self::Coordination => "coordination",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Structured error from a refresh operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct RefreshError {
    pub kind: ErrorKind,
    /// Stable machine-readable code recorded in refresh history.
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl RefreshError {
    fn new(
        kind: ErrorKind,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Definition-level failure; never retried.
    #[must_use]
    pub fn definitional(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Definitional, false, code, message)
    }

    /// Transient lake failure; retried with backoff within the attempt.
    #[must_use]
    pub fn transient_lake(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientLake, true, code, message)
    }

    /// Resource exhaustion; fails the attempt without automatic retry.
    #[must_use]
    pub fn resource(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, false, code, message)
    }

    /// Coordination failure (lost claim, stale heartbeat, subtask timeout).
    #[must_use]
    pub fn coordination(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Coordination, false, code, message)
    }

    /// Unclassifiable internal failure.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, false, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_code_and_message() {
        let err = RefreshError::transient_lake("LAKE_CONN", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("transient_lake"), "got: {msg}");
        assert!(msg.contains("LAKE_CONN"), "got: {msg}");
        assert!(msg.contains("connection reset"), "got: {msg}");
    }

    #[test]
    fn only_transient_lake_is_retryable() {
        assert!(RefreshError::transient_lake("X", "y").retryable);
        assert!(!RefreshError::definitional("X", "y").retryable);
        assert!(!RefreshError::resource("X", "y").retryable);
        assert!(!RefreshError::coordination("X", "y").retryable);
        assert!(!RefreshError::fatal("X", "y").retryable);
    }

    #[test]
    fn serde_uses_snake_case_kinds() {
        let err = RefreshError::definitional("BAD_QUERY", "cannot parse");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""kind":"definitional""#), "got: {json}");
    }
}
