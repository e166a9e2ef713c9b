//! The process-wide batch scope.
//!
//! At most one scope is open at a time. Its lifecycle is an explicit state
//! machine:
//!
//! ```text
//! Inactive --open--> Active --close--> Draining --results stored--> Inactive
//! ```
//!
//! While Active, statements are registered without any I/O and each
//! registration hands back a [`LazyResult`]. `close` moves the scope to
//! Draining, runs every statement through the [`BatchExecutor`], seals the
//! result store and returns to Inactive.
//!
//! ```rust,ignore
//! use prax_batch::{BatchScope, ResultKind};
//!
//! let scope = BatchScope::open(source, None)?;
//! let a = scope.query("SELECT sleep(1) AS a", Some("a"))?;
//! let b = scope.register(Some("b"), "SELECT sleep(1) AS b", ResultKind::Rows)?;
//! let results = scope.close().await?; // about one second, not two
//!
//! assert!(!results.has_failures());
//! assert_eq!(a.len()?, 1);
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, const_mutex};
use tracing::{debug, info};

use crate::config::{BatchConfig, resolve_default};
use crate::driver::ConnectionSource;
use crate::error::{BatchError, BatchResult};
use crate::executor::{BatchExecutor, BatchOutcome};
use crate::lazy::{LazyResult, ResultStore};
use crate::operation::{Operation, ResultKind};
use crate::results::BatchResults;

struct ActiveScope {
    generation: u64,
    source: Arc<dyn ConnectionSource>,
    config: BatchConfig,
    operations: IndexMap<String, Operation>,
    store: Arc<ResultStore>,
}

enum ScopeState {
    Inactive,
    Active(ActiveScope),
    Draining { generation: u64 },
}

static STATE: Mutex<ScopeState> = const_mutex(ScopeState::Inactive);
static GENERATION: AtomicU64 = AtomicU64::new(1);
static AUTO_KEY: AtomicU64 = AtomicU64::new(1);

/// Resets the scope to Inactive if the close future is dropped mid-batch.
///
/// The batch's connections are then dropped without `close()`; drivers stop
/// their in-flight statements on drop (the MySQL driver aborts the statement
/// task).
struct DrainGuard {
    generation: u64,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock();
        if matches!(*state, ScopeState::Draining { generation } if generation == self.generation) {
            *state = ScopeState::Inactive;
        }
    }
}

fn auto_key(sql: &str) -> String {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    format!(
        "q{}_{:016x}",
        AUTO_KEY.fetch_add(1, Ordering::Relaxed),
        hasher.finish()
    )
}

/// Entry points of the process-wide batch scope.
pub struct BatchScope;

impl BatchScope {
    /// Open the scope.
    ///
    /// When `config` is `None` it is resolved through the default
    /// [`ConfigProvider`](crate::ConfigProvider). The configuration is
    /// validated and checked against the source before the scope opens; no
    /// connection is made.
    pub fn open(
        source: Arc<dyn ConnectionSource>,
        config: Option<BatchConfig>,
    ) -> BatchResult<ScopeHandle> {
        if !matches!(*STATE.lock(), ScopeState::Inactive) {
            return Err(BatchError::AlreadyActive);
        }

        let config = match config {
            Some(config) => config,
            None => resolve_default()?,
        };
        config.validate()?;
        if !source.supports(config.kind) {
            return Err(BatchError::unsupported_backend(format!(
                "{} (source: {})",
                config.kind,
                source.backend()
            )));
        }
        if !source.capabilities().nonblocking_dispatch {
            return Err(BatchError::missing_capability(format!(
                "non-blocking dispatch (source: {})",
                source.backend()
            )));
        }

        let mut state = STATE.lock();
        if !matches!(*state, ScopeState::Inactive) {
            return Err(BatchError::AlreadyActive);
        }
        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
        *state = ScopeState::Active(ActiveScope {
            generation,
            source,
            config,
            operations: IndexMap::new(),
            store: Arc::new(ResultStore::new()),
        });

        info!(generation, "Batch scope opened");
        Ok(ScopeHandle { generation })
    }

    /// Check if a scope is open. Pure query.
    pub fn is_active() -> bool {
        matches!(*STATE.lock(), ScopeState::Active(_))
    }

    /// Register a statement in the open scope.
    pub fn register(
        key: Option<&str>,
        sql: impl Into<String>,
        kind: ResultKind,
    ) -> BatchResult<LazyResult> {
        register_in(None, key, sql.into(), kind)
    }

    /// Register raw SQL, inferring the result kind from its leading keyword.
    pub fn query(sql: impl Into<String>, key: Option<&str>) -> BatchResult<LazyResult> {
        let sql = sql.into();
        let kind = ResultKind::infer(&sql);
        register_in(None, key, sql, kind)
    }

    /// Override the deadline of the open scope.
    pub fn set_timeout(timeout: Duration) -> BatchResult<()> {
        set_timeout_in(None, timeout)
    }

    /// Close the open scope and run its statements.
    pub async fn close() -> BatchResult<BatchResults> {
        Ok(BatchResults::new(close_in(None).await?.results))
    }

    /// Force the scope back to Inactive, discarding anything registered.
    ///
    /// Meant for test teardown. Lazy results of a discarded scope stay
    /// unresolvable.
    pub fn reset() {
        let previous = mem::replace(&mut *STATE.lock(), ScopeState::Inactive);
        if !matches!(previous, ScopeState::Inactive) {
            debug!("Batch scope reset");
        }
    }
}

/// Handle to the scope it opened.
///
/// Operations through a handle fail with [`BatchError::NoActiveScope`] once
/// its scope has closed, even if another scope has opened since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeHandle {
    generation: u64,
}

impl ScopeHandle {
    /// Generation number of the scope.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if this handle's scope is still open.
    pub fn is_active(&self) -> bool {
        matches!(&*STATE.lock(), ScopeState::Active(active) if active.generation == self.generation)
    }

    /// Number of registered statements.
    pub fn len(&self) -> BatchResult<usize> {
        with_active(Some(self.generation), |active| Ok(active.operations.len()))
    }

    /// Check if nothing has been registered.
    pub fn is_empty(&self) -> BatchResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Register a statement.
    pub fn register(
        &self,
        key: Option<&str>,
        sql: impl Into<String>,
        kind: ResultKind,
    ) -> BatchResult<LazyResult> {
        register_in(Some(self.generation), key, sql.into(), kind)
    }

    /// Register raw SQL, inferring the result kind.
    pub fn query(&self, sql: impl Into<String>, key: Option<&str>) -> BatchResult<LazyResult> {
        let sql = sql.into();
        let kind = ResultKind::infer(&sql);
        register_in(Some(self.generation), key, sql, kind)
    }

    /// Override the deadline of this scope.
    pub fn set_timeout(&self, timeout: Duration) -> BatchResult<()> {
        set_timeout_in(Some(self.generation), timeout)
    }

    /// Close the scope and run its statements.
    pub async fn close(self) -> BatchResult<BatchResults> {
        Ok(BatchResults::new(close_in(Some(self.generation)).await?.results))
    }

    /// Close the scope, returning execution counters as well.
    pub async fn close_with_stats(self) -> BatchResult<BatchOutcome> {
        close_in(Some(self.generation)).await
    }
}

fn with_active<T>(
    generation: Option<u64>,
    f: impl FnOnce(&mut ActiveScope) -> BatchResult<T>,
) -> BatchResult<T> {
    let mut state = STATE.lock();
    match &mut *state {
        ScopeState::Active(active) if generation.is_none_or(|g| g == active.generation) => f(active),
        _ => Err(BatchError::NoActiveScope),
    }
}

fn register_in(
    generation: Option<u64>,
    key: Option<&str>,
    sql: String,
    kind: ResultKind,
) -> BatchResult<LazyResult> {
    with_active(generation, |active| {
        let key = match key {
            Some(key) => key.to_string(),
            None => auto_key(&sql),
        };
        if active.operations.contains_key(&key) {
            return Err(BatchError::duplicate_key(key));
        }

        debug!(key = %key, kind = %kind, "Registered statement");
        let lazy = LazyResult::new(key.clone(), kind, Arc::clone(&active.store));
        active
            .operations
            .insert(key.clone(), Operation::new(key, sql, kind));
        Ok(lazy)
    })
}

fn set_timeout_in(generation: Option<u64>, timeout: Duration) -> BatchResult<()> {
    if timeout.is_zero() {
        return Err(BatchError::config("timeout must be greater than zero"));
    }
    with_active(generation, |active| {
        active.config.timeout = timeout;
        Ok(())
    })
}

async fn close_in(generation: Option<u64>) -> BatchResult<BatchOutcome> {
    let active = {
        let mut state = STATE.lock();
        match mem::replace(&mut *state, ScopeState::Inactive) {
            ScopeState::Active(active) if generation.is_none_or(|g| g == active.generation) => {
                *state = ScopeState::Draining {
                    generation: active.generation,
                };
                active
            }
            other => {
                *state = other;
                return Err(BatchError::NoActiveScope);
            }
        }
    };
    let guard = DrainGuard {
        generation: active.generation,
    };

    let operations: Vec<Operation> = active.operations.into_values().collect();
    info!(
        generation = active.generation,
        operations = operations.len(),
        "Closing batch scope"
    );

    let outcome = if operations.is_empty() {
        BatchOutcome::default()
    } else {
        BatchExecutor::new(active.source, active.config)
            .run_batch(operations)
            .await
    };

    active.store.seal(outcome.results.clone());
    drop(guard);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Capabilities;
    use crate::error::{DriverError, FailureKind};
    use crate::operation::RawResult;
    use crate::testing::{Script, ScriptedSource, scope_lock};
    use crate::DatabaseKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    fn config() -> BatchConfig {
        BatchConfig::default()
    }

    fn source(scripted: &ScriptedSource) -> Arc<dyn ConnectionSource> {
        Arc::new(scripted.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new().on("SELECT 1 AS a", Script::rows(vec![json!({"a": 1})]));

        assert!(!BatchScope::is_active());
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        assert!(BatchScope::is_active());
        assert!(scope.is_active());

        let lazy = scope.query("SELECT 1 AS a", Some("a")).unwrap();
        assert_eq!(lazy.kind(), ResultKind::Rows);
        assert_eq!(scope.len().unwrap(), 1);
        assert_eq!(lazy.len().unwrap_err(), BatchError::ResultNotReady("a".into()));

        let results = scope.close().await.unwrap();
        assert!(!BatchScope::is_active());
        assert!(!scope.is_active());
        assert_eq!(results.len(), 1);
        assert_eq!(lazy.value("a").unwrap(), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_close_skips_driver() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new();
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        let results = scope.close().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(scripted.stats().connects, 0);
        assert_eq!(scripted.stats().polls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_misuse() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new();

        assert_eq!(BatchScope::close().await.unwrap_err(), BatchError::NoActiveScope);
        assert_eq!(
            BatchScope::register(Some("k"), "SELECT 1", ResultKind::Rows).unwrap_err(),
            BatchError::NoActiveScope
        );

        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        assert_eq!(
            BatchScope::open(source(&scripted), Some(config())).unwrap_err(),
            BatchError::AlreadyActive
        );

        scope.register(Some("k"), "SELECT 1", ResultKind::Rows).unwrap();
        assert_eq!(
            scope.register(Some("k"), "SELECT 2", ResultKind::Rows).unwrap_err(),
            BatchError::duplicate_key("k")
        );

        scope.close().await.unwrap();
        assert_eq!(scripted.stats().dispatches, 1);
        assert_eq!(scope.close().await.unwrap_err(), BatchError::NoActiveScope);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new();
        let first = BatchScope::open(source(&scripted), Some(config())).unwrap();
        first.close().await.unwrap();

        let second = BatchScope::open(source(&scripted), Some(config())).unwrap();
        assert_ne!(first.generation(), second.generation());
        assert_eq!(
            first.query("SELECT 1", None).unwrap_err(),
            BatchError::NoActiveScope
        );
        assert!(second.query("SELECT 1", None).is_ok());
        BatchScope::reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_keys_are_unique() {
        let _lock = scope_lock();
        let scope = BatchScope::open(source(&ScriptedSource::new()), Some(config())).unwrap();
        let a = scope.query("SELECT 1", None).unwrap();
        let b = scope.query("SELECT 1", None).unwrap();
        assert_ne!(a.key(), b.key());
        assert!(a.key().starts_with('q'));
        BatchScope::reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation() {
        let _lock = scope_lock();
        let postgres = config().kind(DatabaseKind::Postgres);
        assert!(matches!(
            BatchScope::open(source(&ScriptedSource::new()), Some(postgres)),
            Err(BatchError::UnsupportedBackend(_))
        ));

        let blocking = ScriptedSource::new().with_capabilities(Capabilities::default());
        assert!(matches!(
            BatchScope::open(source(&blocking), Some(config())),
            Err(BatchError::MissingCapability(_))
        ));

        assert!(matches!(
            BatchScope::open(source(&ScriptedSource::new()), Some(config().max_pool_size(0))),
            Err(BatchError::Config(_))
        ));
        assert!(!BatchScope::is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new().on(
            "SELECT sleep(3)",
            Script::rows(vec![]).delay(Duration::from_secs(3)),
        );
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        assert!(scope.set_timeout(Duration::ZERO).is_err());
        scope.set_timeout(Duration::from_secs(1)).unwrap();
        let slow = scope.query("SELECT sleep(3)", Some("slow")).unwrap();

        let started = Instant::now();
        let results = scope.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results["slow"], RawResult::timeout());
        assert!(slow.resolve().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_unbounded() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new();
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        scope.set_timeout(Duration::MAX).unwrap();
        let touched = scope.query("UPDATE t SET a = 1", Some("t")).unwrap();

        let results = scope.close().await.unwrap();
        assert!(!results.has_failures());
        assert!(touched.resolve().is_ok());
        assert_eq!(scripted.stats().dispatches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_stats() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new().on(
            "SELECT 1",
            Script::rows(vec![]).fail_dispatch(1, DriverError::connection(2013, "lost")),
        );
        let config = config().retry(crate::RetryPolicy::new().fixed_delay(Duration::from_millis(5)));
        let scope = BatchScope::open(source(&scripted), Some(config)).unwrap();
        scope.query("SELECT 1", Some("k")).unwrap();

        let outcome = scope.close_with_stats().await.unwrap();
        assert_eq!(outcome.stats.retries, 1);
        assert_eq!(outcome.stats.successful, 1);
        assert!(outcome.results["k"].as_failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_close_returns_to_inactive() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new().default_script(Script::exec(1, 0).delay(Duration::from_secs(5)));
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        let lazy = scope.query("UPDATE t SET a = 1", None).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), scope.close()).await;
        assert!(result.is_err());
        assert!(!BatchScope::is_active());
        assert!(matches!(lazy.resolve(), Err(BatchError::ResultNotReady(_))));
        assert!(BatchScope::open(source(&scripted), Some(config())).is_ok());
        BatchScope::reset();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_surfaces_through_lazy() {
        let _lock = scope_lock();
        let scripted = ScriptedSource::new().on(
            "SELECT nme FROM users",
            Script::query_error(1054, "Unknown column 'nme' in 'field list'"),
        );
        let scope = BatchScope::open(source(&scripted), Some(config())).unwrap();
        let lazy = scope.query("SELECT nme FROM users", Some("users")).unwrap();
        let results = scope.close().await.unwrap();

        assert!(results.has_failures());
        let err = lazy.rows().unwrap_err();
        assert_eq!(err.code(), Some(1054));
        assert!(matches!(err, BatchError::Failed { kind: FailureKind::Query, .. }));
    }
}
