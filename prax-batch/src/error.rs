//! Error types for batch scopes and lazy results.
//!
//! Two layers of errors exist:
//!
//! - [`BatchError`] is what callers see. Scope misuse (nested open, close
//!   without open, duplicate keys) and configuration problems are reported
//!   immediately and never retried. Resolving a [`LazyResult`](crate::LazyResult)
//!   can also fail, either because the batch has not closed yet or because the
//!   statement itself failed.
//! - [`DriverError`] is what a connection source reports while dispatching or
//!   reaping. It never escapes a batch: the executor folds it into a per-key
//!   [`RawResult::Failure`](crate::RawResult::Failure).
//!
//! ```rust
//! use prax_batch::{BatchError, FailureKind};
//!
//! let err = BatchError::duplicate_key("users");
//! assert!(err.is_scope_error());
//!
//! let err = BatchError::failed("users", FailureKind::Query, "Unknown column 'nme'", 1054);
//! assert_eq!(err.code(), Some(1054));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Classification of a per-key failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Dispatch or reconnect failed after retries were exhausted.
    Connection,
    /// The server rejected the statement (bad SQL, constraint violation, ...).
    Query,
    /// The batch deadline elapsed before the statement completed.
    Timeout,
}

impl FailureKind {
    /// Get the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the batch scope and by lazy results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// A scope is already open (or still draining).
    #[error("Batch scope already active")]
    AlreadyActive,

    /// No scope is open.
    #[error("No active batch scope")]
    NoActiveScope,

    /// The key was already registered in the open scope.
    #[error("Duplicate batch key: {0}")]
    DuplicateKey(String),

    /// The configured database kind is not handled by the connection source.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// The connection source lacks a capability the executor needs.
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// Invalid or unresolvable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The result was accessed before its scope closed.
    #[error("Result for '{0}' is not ready: the batch scope has not closed")]
    ResultNotReady(String),

    /// The scope closed without producing an entry for the key.
    #[error("No result stored for key '{0}'")]
    UnknownKey(String),

    /// The statement for this key failed.
    #[error("Query [{key}] failed: {message}")]
    Failed {
        /// The batch key.
        key: String,
        /// Failure classification.
        kind: FailureKind,
        /// Driver message.
        message: String,
        /// Driver error code (0 when none applies).
        code: i32,
    },
}

impl BatchError {
    /// Create a duplicate key error.
    pub fn duplicate_key(key: impl Into<String>) -> Self {
        Self::DuplicateKey(key.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unsupported backend error.
    pub fn unsupported_backend(name: impl Into<String>) -> Self {
        Self::UnsupportedBackend(name.into())
    }

    /// Create a missing capability error.
    pub fn missing_capability(name: impl Into<String>) -> Self {
        Self::MissingCapability(name.into())
    }

    /// Create a per-key failure error.
    pub fn failed(
        key: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        code: i32,
    ) -> Self {
        Self::Failed {
            key: key.into(),
            kind,
            message: message.into(),
            code,
        }
    }

    /// Check if this error reports misuse of the scope lifecycle.
    pub fn is_scope_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyActive | Self::NoActiveScope | Self::DuplicateKey(_)
        )
    }

    /// Check if this error was raised while validating a scope before it opened.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedBackend(_) | Self::MissingCapability(_) | Self::Config(_)
        )
    }

    /// Check if this is a stored per-key failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Check if this is a timeout failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        )
    }

    /// Check if this is a connection failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                kind: FailureKind::Connection,
                ..
            }
        )
    }

    /// Get the driver error code of a stored failure.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Get the batch key this error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::DuplicateKey(key)
            | Self::ResultNotReady(key)
            | Self::UnknownKey(key)
            | Self::Failed { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Class of a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The connection is unusable (refused, gone away, lost mid-query).
    Connection,
    /// The server reported a statement-level error.
    Query,
}

/// Error reported by a [`ConnectionSource`](crate::ConnectionSource) or
/// [`AsyncConnection`](crate::AsyncConnection).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct DriverError {
    /// Error class.
    pub kind: DriverErrorKind,
    /// Backend specific numeric code (0 when unknown).
    pub code: i32,
    /// Driver message.
    pub message: String,
}

impl DriverError {
    /// Create a connection-class error.
    pub fn connection(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connection,
            code,
            message: message.into(),
        }
    }

    /// Create a statement-level error.
    pub fn query(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Query,
            code,
            message: message.into(),
        }
    }

    /// Check if this is a connection-class error.
    pub fn is_connection_error(&self) -> bool {
        self.kind == DriverErrorKind::Connection
    }

    /// The failure kind this error maps to when stored for a key.
    pub fn failure_kind(&self) -> FailureKind {
        match self.kind {
            DriverErrorKind::Connection => FailureKind::Connection,
            DriverErrorKind::Query => FailureKind::Query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_errors() {
        assert!(BatchError::AlreadyActive.is_scope_error());
        assert!(BatchError::NoActiveScope.is_scope_error());
        assert!(BatchError::duplicate_key("k").is_scope_error());
        assert!(!BatchError::config("bad").is_scope_error());
        assert!(BatchError::config("bad").is_validation_error());
        assert!(BatchError::unsupported_backend("oracle").is_validation_error());
    }

    #[test]
    fn test_failed_error_display() {
        let err = BatchError::failed("users", FailureKind::Query, "syntax error", 1064);
        assert_eq!(err.to_string(), "Query [users] failed: syntax error");
        assert_eq!(err.code(), Some(1064));
        assert_eq!(err.key(), Some("users"));
        assert!(err.is_failure());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_failed_kind_predicates() {
        let timeout = BatchError::failed("k", FailureKind::Timeout, "timeout", 0);
        assert!(timeout.is_timeout());
        let conn = BatchError::failed("k", FailureKind::Connection, "gone away", 2006);
        assert!(conn.is_connection_error());
    }

    #[test]
    fn test_driver_error() {
        let err = DriverError::connection(2006, "MySQL server has gone away");
        assert!(err.is_connection_error());
        assert_eq!(err.failure_kind(), FailureKind::Connection);
        assert_eq!(err.to_string(), "[2006] MySQL server has gone away");

        let err = DriverError::query(1146, "Table 'app.nope' doesn't exist");
        assert!(!err.is_connection_error());
        assert_eq!(err.failure_kind(), FailureKind::Query);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
        assert_eq!(FailureKind::Connection.as_str(), "connection");
    }
}
