//! Lazy results handed out at registration time.
//!
//! A [`LazyResult`] is created before its statement has even been sent. It
//! holds a shared handle to the result store of its batch and looks its own
//! key up on first access after the batch closes. The value (or the error) is
//! cached from then on.
//!
//! # Example
//!
//! ```rust,ignore
//! let scope = BatchScope::open(source, None)?;
//! let users = scope.query("SELECT id, name FROM users", Some("users"))?;
//! let bumped = scope.register(None, "UPDATE counters SET n = n + 1", ResultKind::Exec)?;
//!
//! assert!(users.rows().is_err()); // not ready yet
//! scope.close().await?;
//!
//! for row in users.iter()? {
//!     println!("{}", row["name"]);
//! }
//! println!("bumped {:?}", bumped.affected_rows()?);
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::{Value as JsonValue, json};

use crate::error::{BatchError, BatchResult};
use crate::operation::{RawResult, ResultKind, Row};

/// Per-batch result storage, written once when the batch closes.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: OnceLock<IndexMap<String, RawResult>>,
}

impl ResultStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store the results of the batch. Only the first call has any effect.
    pub(crate) fn seal(&self, results: IndexMap<String, RawResult>) -> bool {
        self.results.set(results).is_ok()
    }

    /// Check if the batch has closed.
    pub fn is_sealed(&self) -> bool {
        self.results.get().is_some()
    }

    /// Look up the result of a key. `None` before the batch closed.
    pub fn get(&self, key: &str) -> Option<&RawResult> {
        self.results.get().and_then(|results| results.get(key))
    }

    /// Number of stored results.
    pub fn len(&self) -> usize {
        self.results.get().map_or(0, IndexMap::len)
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Placeholder for the result of one registered statement.
#[derive(Clone)]
pub struct LazyResult {
    key: String,
    kind: ResultKind,
    store: Arc<ResultStore>,
    cached: OnceLock<Result<RawResult, BatchError>>,
}

impl LazyResult {
    pub(crate) fn new(key: impl Into<String>, kind: ResultKind, store: Arc<ResultStore>) -> Self {
        Self {
            key: key.into(),
            kind,
            store,
            cached: OnceLock::new(),
        }
    }

    /// The batch key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The result kind requested at registration.
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// Check if the value has been fetched. Never forces resolution.
    pub fn is_resolved(&self) -> bool {
        self.cached.get().is_some()
    }

    /// Fetch the result, caching it on the first successful lookup.
    ///
    /// Returns [`BatchError::ResultNotReady`] while the batch is open (not
    /// cached), [`BatchError::UnknownKey`] if the batch stored nothing for the
    /// key, and [`BatchError::Failed`] if the statement failed.
    pub fn resolve(&self) -> BatchResult<&RawResult> {
        if let Some(cached) = self.cached.get() {
            return cached.as_ref().map_err(Clone::clone);
        }
        if !self.store.is_sealed() {
            return Err(BatchError::ResultNotReady(self.key.clone()));
        }

        let fetched = match self.store.get(&self.key) {
            None => Err(BatchError::UnknownKey(self.key.clone())),
            Some(result) => match result.to_error(&self.key) {
                Some(err) => Err(err),
                None => Ok(result.clone()),
            },
        };
        self.cached
            .get_or_init(|| fetched)
            .as_ref()
            .map_err(Clone::clone)
    }

    /// All rows. A write result has none.
    pub fn rows(&self) -> BatchResult<&[Row]> {
        Ok(self.resolve()?.rows().unwrap_or(&[]))
    }

    /// The row at `index`.
    pub fn row(&self, index: usize) -> BatchResult<Option<&Row>> {
        Ok(self.rows()?.get(index))
    }

    /// The first row.
    pub fn first(&self) -> BatchResult<Option<&Row>> {
        self.row(0)
    }

    /// A column of the first row.
    pub fn value(&self, column: &str) -> BatchResult<Option<&JsonValue>> {
        Ok(self.first()?.and_then(|row| row.get(column)))
    }

    /// Number of rows.
    pub fn len(&self) -> BatchResult<usize> {
        Ok(self.rows()?.len())
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> BatchResult<bool> {
        Ok(self.rows()?.is_empty())
    }

    /// Iterate over the rows.
    pub fn iter(&self) -> BatchResult<std::slice::Iter<'_, Row>> {
        Ok(self.rows()?.iter())
    }

    /// Affected-row count of a write; `None` for a read.
    pub fn affected_rows(&self) -> BatchResult<Option<u64>> {
        Ok(self.resolve()?.affected_rows())
    }

    /// Last generated id of a write; `None` for a read.
    pub fn insert_id(&self) -> BatchResult<Option<u64>> {
        Ok(self.resolve()?.insert_id())
    }

    /// Convert to plain JSON: an array of row objects for a read, an object
    /// with `affected_rows` and `insert_id` for a write.
    pub fn to_json(&self) -> BatchResult<JsonValue> {
        Ok(match self.resolve()? {
            RawResult::Rows { rows } => {
                JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect())
            }
            RawResult::Exec {
                affected_rows,
                insert_id,
            } => json!({ "affected_rows": affected_rows, "insert_id": insert_id }),
            RawResult::Failure(_) => JsonValue::Null,
        })
    }
}

impl fmt::Debug for LazyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LazyResult");
        s.field("key", &self.key).field("kind", &self.kind);
        match self.cached.get() {
            Some(Ok(value)) => s.field("value", value),
            Some(Err(err)) => s.field("error", err),
            None => s.field("resolved", &false),
        };
        s.finish()
    }
}

impl Serialize for LazyResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_json() {
            Ok(value) => value.serialize(serializer),
            Err(err) => Err(serde::ser::Error::custom(err)),
        }
    }
}
