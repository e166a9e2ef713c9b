//! Operation descriptors and raw results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{BatchError, DriverError, FailureKind};

/// A single result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// The shape a caller expects back from a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// A read returning a result set.
    #[default]
    Rows,
    /// A write returning affected-row and insert-id counters.
    Exec,
}

impl ResultKind {
    /// Infer the result kind of raw SQL from its leading keyword.
    ///
    /// Leading whitespace, `--` and `#` line comments, `/* */` block comments
    /// and opening parentheses are skipped.
    ///
    /// ```rust
    /// use prax_batch::ResultKind;
    ///
    /// assert_eq!(ResultKind::infer("SELECT sleep(1)"), ResultKind::Rows);
    /// assert_eq!(ResultKind::infer("  -- audit\n WITH t AS (SELECT 1) SELECT * FROM t"), ResultKind::Rows);
    /// assert_eq!(ResultKind::infer("UPDATE users SET last_login = NOW()"), ResultKind::Exec);
    /// ```
    pub fn infer(sql: &str) -> Self {
        let keyword: String = skip_preamble(sql)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "SHOW" | "WITH" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE" => {
                Self::Rows
            }
            _ => Self::Exec,
        }
    }

    /// Get the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rows => "rows",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn skip_preamble(mut sql: &str) -> &str {
    loop {
        let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(rest) = trimmed
            .strip_prefix("--")
            .or_else(|| trimmed.strip_prefix('#'))
        {
            sql = rest.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return trimmed;
        }
    }
}

/// A statement registered in a batch scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    key: String,
    sql: String,
    kind: ResultKind,
}

impl Operation {
    /// Create a new operation.
    pub fn new(key: impl Into<String>, sql: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            key: key.into(),
            sql: sql.into(),
            kind,
        }
    }

    /// Create a read operation.
    pub fn rows(key: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(key, sql, ResultKind::Rows)
    }

    /// Create a write operation.
    pub fn exec(key: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(key, sql, ResultKind::Exec)
    }

    /// The batch key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The expected result kind.
    pub fn kind(&self) -> ResultKind {
        self.kind
    }
}

/// What a connection hands back when a dispatched statement is reaped.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaped {
    /// The statement produced a result set.
    ResultSet(Vec<Row>),
    /// The statement produced affected-row counters.
    Affected {
        /// Rows changed by the statement.
        affected_rows: u64,
        /// Last generated id (0 when none).
        insert_id: u64,
    },
}

/// Description of a failed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Driver message, or `"timeout"`.
    pub message: String,
    /// Driver error code (0 when none applies).
    pub code: i32,
}

impl Failure {
    /// Create a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>, code: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            code,
        }
    }

    /// The failure recorded for statements still pending at the deadline.
    pub fn timeout() -> Self {
        Self::new(FailureKind::Timeout, "timeout", 0)
    }
}

impl From<DriverError> for Failure {
    fn from(err: DriverError) -> Self {
        Self::new(err.failure_kind(), err.message, err.code)
    }
}

/// The outcome of one operation, written once when the batch closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawResult {
    /// Rows returned by a read.
    Rows {
        /// The result rows.
        rows: Vec<Row>,
    },
    /// Counters returned by a write.
    Exec {
        /// Rows changed by the statement.
        affected_rows: u64,
        /// Last generated id (0 when none).
        insert_id: u64,
    },
    /// The statement failed.
    Failure(Failure),
}

impl RawResult {
    /// Create a failure result.
    pub fn failure(kind: FailureKind, message: impl Into<String>, code: i32) -> Self {
        Self::Failure(Failure::new(kind, message, code))
    }

    /// Create a timeout failure.
    pub fn timeout() -> Self {
        Self::Failure(Failure::timeout())
    }

    /// Check if this is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Get the rows of a read result.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows { rows } => Some(rows),
            _ => None,
        }
    }

    /// Get the affected-row count of a write result.
    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            Self::Exec { affected_rows, .. } => Some(*affected_rows),
            _ => None,
        }
    }

    /// Get the insert id of a write result.
    pub fn insert_id(&self) -> Option<u64> {
        match self {
            Self::Exec { insert_id, .. } => Some(*insert_id),
            _ => None,
        }
    }

    /// Get the failure description.
    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Convert a failure into the error raised on access.
    pub fn to_error(&self, key: &str) -> Option<BatchError> {
        self.as_failure()
            .map(|f| BatchError::failed(key, f.kind, f.message.clone(), f.code))
    }
}

impl From<Reaped> for RawResult {
    fn from(reaped: Reaped) -> Self {
        match reaped {
            Reaped::ResultSet(rows) => Self::Rows { rows },
            Reaped::Affected {
                affected_rows,
                insert_id,
            } => Self::Exec {
                affected_rows,
                insert_id,
            },
        }
    }
}

impl From<DriverError> for RawResult {
    fn from(err: DriverError) -> Self {
        Self::Failure(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_reads() {
        assert_eq!(ResultKind::infer("select 1"), ResultKind::Rows);
        assert_eq!(ResultKind::infer("SHOW TABLES"), ResultKind::Rows);
        assert_eq!(ResultKind::infer("(SELECT 1) UNION (SELECT 2)"), ResultKind::Rows);
        assert_eq!(ResultKind::infer("EXPLAIN SELECT * FROM users"), ResultKind::Rows);
        assert_eq!(ResultKind::infer("desc users"), ResultKind::Rows);
    }

    #[test]
    fn test_infer_writes() {
        assert_eq!(ResultKind::infer("INSERT INTO logs (message) VALUES ('x')"), ResultKind::Exec);
        assert_eq!(ResultKind::infer("delete from logs"), ResultKind::Exec);
        assert_eq!(ResultKind::infer(""), ResultKind::Exec);
    }

    #[test]
    fn test_infer_skips_comments() {
        assert_eq!(ResultKind::infer("/* hint */ SELECT 1"), ResultKind::Rows);
        assert_eq!(ResultKind::infer("# note\nUPDATE t SET a = 1"), ResultKind::Exec);
        assert_eq!(ResultKind::infer("-- only a comment"), ResultKind::Exec);
        assert_eq!(ResultKind::infer("/* unterminated"), ResultKind::Exec);
    }

    #[test]
    fn test_raw_result_from_reaped() {
        let rows = vec![json!({"a": 1, "b": "x"}).as_object().cloned().unwrap()];
        let result = RawResult::from(Reaped::ResultSet(rows.clone()));
        assert_eq!(result.rows(), Some(rows.as_slice()));
        assert_eq!(result.affected_rows(), None);

        let result = RawResult::from(Reaped::Affected {
            affected_rows: 3,
            insert_id: 7,
        });
        assert_eq!(result.affected_rows(), Some(3));
        assert_eq!(result.insert_id(), Some(7));
        assert!(result.rows().is_none());
    }

    #[test]
    fn test_raw_result_failure_to_error() {
        let result = RawResult::from(DriverError::query(1064, "You have an error in your SQL syntax"));
        assert!(result.is_failure());
        let err = result.to_error("k").unwrap();
        assert_eq!(err.code(), Some(1064));
        assert_eq!(err.key(), Some("k"));

        assert!(RawResult::Exec { affected_rows: 0, insert_id: 0 }.to_error("k").is_none());
    }

    #[test]
    fn test_raw_result_serialization() {
        let result = RawResult::Exec {
            affected_rows: 3,
            insert_id: 7,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"type": "exec", "affected_rows": 3, "insert_id": 7}));

        let value = serde_json::to_value(RawResult::timeout()).unwrap();
        assert_eq!(
            value,
            json!({"type": "failure", "kind": "timeout", "message": "timeout", "code": 0})
        );
    }

    #[test]
    fn test_operation_accessors() {
        let op = Operation::exec("log", "INSERT INTO logs VALUES (1)");
        assert_eq!(op.key(), "log");
        assert_eq!(op.kind(), ResultKind::Exec);
        assert!(op.sql().starts_with("INSERT"));
    }
}
