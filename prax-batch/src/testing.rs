//! Scripted in-memory connection source for tests and benchmarks.
//!
//! Statements are matched by exact SQL text against registered [`Script`]s;
//! unmatched statements use the default script. Completion times run on the
//! tokio clock, so tests using `#[tokio::test(start_paused = true)]` observe
//! deterministic timing. Enable the `testing` feature to use it outside this
//! crate.
//!
//! ```rust,ignore
//! use prax_batch::testing::{Script, ScriptedSource};
//! use std::time::Duration;
//!
//! let source = ScriptedSource::new()
//!     .on("SELECT 1 AS a", Script::rows(vec![serde_json::json!({"a": 1})]))
//!     .on("UPDATE t SET a = 1", Script::exec(3, 0).delay(Duration::from_millis(50)));
//! assert_eq!(source.stats().connects, 0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard, const_mutex};
use serde_json::Value as JsonValue;
use tokio::time::{Instant, sleep, sleep_until};

use crate::config::{BatchConfig, DatabaseKind};
use crate::driver::{
    AsyncConnection, Capabilities, ConnStatus, ConnectionId, ConnectionSource, Readiness,
};
use crate::error::{DriverError, DriverResult};
use crate::operation::{Reaped, Row};
use crate::retry::{CR_CONN_HOST_ERROR, CR_SERVER_GONE_ERROR};
use crate::scope::BatchScope;

static SCOPE_LOCK: Mutex<()> = const_mutex(());

/// Serialize tests that drive the process-wide scope.
///
/// The scope is reset to Inactive once the lock is held.
pub fn scope_lock() -> MutexGuard<'static, ()> {
    let guard = SCOPE_LOCK.lock();
    BatchScope::reset();
    guard
}

#[derive(Debug, Clone)]
enum Outcome {
    Rows(Vec<Row>),
    Exec { affected_rows: u64, insert_id: u64 },
    Error(DriverError),
}

/// Scripted behaviour for one SQL text.
#[derive(Debug, Clone)]
pub struct Script {
    outcome: Outcome,
    delay: Duration,
    dispatch_failures: u32,
    dispatch_error: DriverError,
    poll_error: Option<DriverError>,
}

impl Script {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            dispatch_failures: 0,
            dispatch_error: DriverError::connection(CR_SERVER_GONE_ERROR, "MySQL server has gone away"),
            poll_error: None,
        }
    }

    /// Complete with a result set. Non-object values become empty rows.
    pub fn rows(rows: Vec<JsonValue>) -> Self {
        let rows = rows
            .into_iter()
            .map(|value| match value {
                JsonValue::Object(map) => map,
                _ => Row::new(),
            })
            .collect();
        Self::with_outcome(Outcome::Rows(rows))
    }

    /// Complete with affected-row counters.
    pub fn exec(affected_rows: u64, insert_id: u64) -> Self {
        Self::with_outcome(Outcome::Exec {
            affected_rows,
            insert_id,
        })
    }

    /// Complete with a statement-level error.
    pub fn query_error(code: i32, message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Error(DriverError::query(code, message)))
    }

    /// Complete after `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `times` dispatches with a connection error.
    pub fn fail_dispatch(mut self, times: u32, error: DriverError) -> Self {
        self.dispatch_failures = times;
        self.dispatch_error = error;
        self
    }

    /// Fail every dispatch with a connection error.
    pub fn always_fail_dispatch(self, error: DriverError) -> Self {
        self.fail_dispatch(u32::MAX, error)
    }

    /// Report the connection as errored once the delay elapses.
    pub fn fail_poll(mut self, error: DriverError) -> Self {
        self.poll_error = Some(error);
        self
    }
}

/// Call counts recorded by a [`ScriptedSource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    /// `connect` calls.
    pub connects: u64,
    /// `dispatch` calls, failed ones included.
    pub dispatches: u64,
    /// `reconnect` calls.
    pub reconnects: u64,
    /// `close` calls.
    pub closes: u64,
    /// `poll_ready` calls.
    pub polls: u64,
    /// Highest number of statements in flight at once.
    pub max_in_flight: u64,
}

#[derive(Debug)]
struct InFlight {
    ready_at: Instant,
    poll_error: Option<DriverError>,
}

#[derive(Debug, Default)]
struct Shared {
    scripts: HashMap<String, Script>,
    default_script: Option<Script>,
    connect_failures: u32,
    in_flight: HashMap<ConnectionId, InFlight>,
    stats: ScriptStats,
}

impl Shared {
    fn script_for(&mut self, sql: &str) -> Script {
        self.scripts
            .get(sql)
            .or(self.default_script.as_ref())
            .cloned()
            .unwrap_or_else(|| Script::exec(0, 0))
    }
}

/// In-memory [`ConnectionSource`] driven by per-statement scripts.
#[derive(Clone)]
pub struct ScriptedSource {
    shared: Arc<Mutex<Shared>>,
    next_id: Arc<AtomicU64>,
    kinds: Vec<DatabaseKind>,
    capabilities: Capabilities,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// Create a MySQL source with non-blocking dispatch.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            kinds: vec![DatabaseKind::MySql],
            capabilities: Capabilities::nonblocking(),
        }
    }

    /// Register the script for a SQL text.
    pub fn on(self, sql: impl Into<String>, script: Script) -> Self {
        self.shared.lock().scripts.insert(sql.into(), script);
        self
    }

    /// Script used for SQL with no registered script.
    pub fn default_script(self, script: Script) -> Self {
        self.shared.lock().default_script = Some(script);
        self
    }

    /// Fail the next `times` connection attempts.
    pub fn fail_connects(self, times: u32) -> Self {
        self.shared.lock().connect_failures = times;
        self
    }

    /// Set the database kinds this source accepts.
    pub fn supporting(mut self, kinds: impl IntoIterator<Item = DatabaseKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Override the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Snapshot of the recorded call counts.
    pub fn stats(&self) -> ScriptStats {
        self.shared.lock().stats
    }

    fn open(&self) -> DriverResult<Box<dyn AsyncConnection>> {
        let mut shared = self.shared.lock();
        if shared.connect_failures > 0 {
            shared.connect_failures -= 1;
            return Err(DriverError::connection(
                CR_CONN_HOST_ERROR,
                "Can't connect to MySQL server",
            ));
        }
        drop(shared);

        Ok(Box::new(ScriptedConnection {
            id: ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            shared: Arc::clone(&self.shared),
            current: None,
        }))
    }
}

#[async_trait]
impl ConnectionSource for ScriptedSource {
    fn backend(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, kind: DatabaseKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self, _config: &BatchConfig) -> DriverResult<Box<dyn AsyncConnection>> {
        self.shared.lock().stats.connects += 1;
        self.open()
    }

    async fn reconnect(
        &self,
        mut broken: Box<dyn AsyncConnection>,
        _config: &BatchConfig,
    ) -> DriverResult<Box<dyn AsyncConnection>> {
        self.shared.lock().stats.reconnects += 1;
        broken.close().await;
        self.open()
    }

    async fn poll_ready(
        &self,
        pending: &mut [&mut dyn AsyncConnection],
        wait: Duration,
    ) -> DriverResult<Readiness> {
        let ids: Vec<ConnectionId> = pending.iter().map(|conn| conn.id()).collect();

        let earliest = {
            let mut shared = self.shared.lock();
            shared.stats.polls += 1;
            ids.iter()
                .filter_map(|id| shared.in_flight.get(id).map(|f| f.ready_at))
                .min()
        };

        let limit = Instant::now() + wait;
        match earliest {
            Some(at) if at <= limit => sleep_until(at).await,
            _ => sleep(wait).await,
        }

        let now = Instant::now();
        let shared = self.shared.lock();
        let mut readiness = Readiness::default();
        for id in ids {
            match shared.in_flight.get(&id) {
                Some(flight) if flight.ready_at <= now => match &flight.poll_error {
                    Some(err) => readiness.errored.push((id, err.clone())),
                    None => readiness.ready.push(id),
                },
                _ => {}
            }
        }
        Ok(readiness)
    }
}

struct ScriptedConnection {
    id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
    current: Option<(Instant, Outcome)>,
}

impl ScriptedConnection {
    fn finish(&mut self) {
        self.shared.lock().in_flight.remove(&self.id);
        self.current = None;
    }
}

#[async_trait]
impl AsyncConnection for ScriptedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn dispatch(&mut self, sql: &str) -> DriverResult<()> {
        let mut shared = self.shared.lock();
        shared.stats.dispatches += 1;

        if let Some(script) = shared.scripts.get_mut(sql) {
            if script.dispatch_failures > 0 {
                if script.dispatch_failures != u32::MAX {
                    script.dispatch_failures -= 1;
                }
                return Err(script.dispatch_error.clone());
            }
        }

        let script = shared.script_for(sql);
        let ready_at = Instant::now() + script.delay;
        shared.in_flight.insert(
            self.id,
            InFlight {
                ready_at,
                poll_error: script.poll_error,
            },
        );
        let in_flight = shared.in_flight.len() as u64;
        shared.stats.max_in_flight = shared.stats.max_in_flight.max(in_flight);
        drop(shared);

        self.current = Some((ready_at, script.outcome));
        Ok(())
    }

    fn status(&mut self) -> ConnStatus {
        match &self.current {
            None => ConnStatus::Idle,
            Some((ready_at, _)) if *ready_at > Instant::now() => ConnStatus::Pending,
            Some(_) => ConnStatus::Ready,
        }
    }

    async fn reap(&mut self) -> DriverResult<Reaped> {
        let (ready_at, outcome) = self
            .current
            .clone()
            .ok_or_else(|| DriverError::query(0, "nothing dispatched"))?;
        sleep_until(ready_at).await;
        self.finish();

        match outcome {
            Outcome::Rows(rows) => Ok(Reaped::ResultSet(rows)),
            Outcome::Exec {
                affected_rows,
                insert_id,
            } => Ok(Reaped::Affected {
                affected_rows,
                insert_id,
            }),
            Outcome::Error(err) => Err(err),
        }
    }

    async fn close(&mut self) {
        self.finish();
        self.shared.lock().stats.closes += 1;
    }
}
