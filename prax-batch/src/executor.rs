//! The dispatch-and-poll executor.
//!
//! [`BatchExecutor::run_batch`] runs every operation of a batch concurrently,
//! one statement per connection, over a pool capped at
//! [`BatchConfig::max_pool_size`]. Operations beyond the cap queue and start
//! as connections free up. The loop waits on
//! [`ConnectionSource::poll_ready`] for at most one wait slice at a time and
//! stops at the batch deadline; anything still pending then is recorded as a
//! timeout. An operation whose dispatch lost its connection waits out its
//! retry backoff off the loop: siblings keep dispatching and completing, and
//! a backoff that would end past the deadline is not waited for. Every
//! connection opened for the batch is closed before returning.
//!
//! No driver error escapes: each key ends with exactly one [`RawResult`].

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use crate::config::BatchConfig;
use crate::driver::{AsyncConnection, ConnectionId, ConnectionSource};
use crate::error::{DriverError, DriverResult, FailureKind};
use crate::operation::{Operation, RawResult};

/// Deadline used when the configured timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Counters for one executed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Operations in the batch.
    pub total: u64,
    /// Operations that produced rows or counters.
    pub successful: u64,
    /// Operations that failed with a connection or query error.
    pub failed: u64,
    /// Operations still pending at the deadline.
    pub timed_out: u64,
    /// Redispatches after connection loss.
    pub retries: u64,
    /// Connections opened, reconnects included.
    pub connections_opened: u64,
    /// Highest number of statements in flight at once.
    pub max_in_flight: usize,
    /// Wall time spent in `run_batch`.
    pub duration: Duration,
}

impl ExecutionStats {
    /// Fraction of operations that succeeded (1.0 for an empty batch).
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

/// Results and counters of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// One result per operation key, in registration order.
    pub results: IndexMap<String, RawResult>,
    /// Execution counters.
    pub stats: ExecutionStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandleState {
    Idle,
    Dispatched { key: String },
    Reaped,
    Broken,
}

/// A connection exclusively owned by one batch.
struct ConnectionHandle {
    conn: Box<dyn AsyncConnection>,
    state: HandleState,
}

impl ConnectionHandle {
    fn new(conn: Box<dyn AsyncConnection>) -> Self {
        Self {
            conn,
            state: HandleState::Idle,
        }
    }

    fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    fn is_available(&self) -> bool {
        matches!(self.state, HandleState::Idle | HandleState::Reaped)
    }

    fn is_live(&self) -> bool {
        self.state != HandleState::Broken
    }

    fn pending_key(&self) -> Option<&str> {
        match &self.state {
            HandleState::Dispatched { key } => Some(key),
            _ => None,
        }
    }
}

/// An operation waiting out its retry backoff.
struct PendingRetry {
    op: Operation,
    attempt: u32,
    conn: Option<Box<dyn AsyncConnection>>,
    retry_at: Instant,
}

/// State of one `run_batch` call.
struct BatchRun {
    pool: Vec<ConnectionHandle>,
    queue: VecDeque<Operation>,
    retrying: Vec<PendingRetry>,
    slots: IndexMap<String, Option<RawResult>>,
    stats: ExecutionStats,
    deadline: Instant,
}

impl BatchRun {
    fn in_flight(&self) -> usize {
        self.pool.iter().filter(|h| h.pending_key().is_some()).count()
    }

    /// Connections in use, plus one reserved per pending retry.
    fn live(&self) -> usize {
        self.pool.iter().filter(|h| h.is_live()).count() + self.retrying.len()
    }

    fn next_retry(&self) -> Option<Instant> {
        self.retrying.iter().map(|pending| pending.retry_at).min()
    }
}

/// Runs batches of operations against a connection source.
pub struct BatchExecutor {
    source: Arc<dyn ConnectionSource>,
    config: BatchConfig,
}

impl BatchExecutor {
    /// Create an executor. Pool cap, wait slice, deadline and retry policy
    /// are read from `config`.
    pub fn new(source: Arc<dyn ConnectionSource>, config: BatchConfig) -> Self {
        Self { source, config }
    }

    /// The executor configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Execute all operations concurrently and collect one result per key.
    ///
    /// Keys must be unique; the scope guarantees this for registered batches.
    #[instrument(skip(self, operations), fields(backend = self.source.backend(), operations = operations.len()))]
    pub async fn run_batch(&self, operations: Vec<Operation>) -> BatchOutcome {
        let started = Instant::now();
        let stats = ExecutionStats {
            total: operations.len() as u64,
            ..Default::default()
        };

        if operations.is_empty() {
            return BatchOutcome {
                results: IndexMap::new(),
                stats,
            };
        }

        info!(
            max_pool_size = self.config.max_pool_size,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Starting batch"
        );

        let now = Instant::now();
        let mut run = BatchRun {
            pool: Vec::new(),
            retrying: Vec::new(),
            slots: operations
                .iter()
                .map(|op| (op.key().to_string(), None))
                .collect(),
            queue: operations.into(),
            stats,
            deadline: now
                .checked_add(self.config.timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
        };

        loop {
            self.resume_retries(&mut run).await;
            self.fill(&mut run).await;

            let in_flight = run.in_flight();
            run.stats.max_in_flight = run.stats.max_in_flight.max(in_flight);
            if in_flight == 0 && run.retrying.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= run.deadline {
                break;
            }
            let mut wait = self.config.wait_slice.min(run.deadline - now);
            if let Some(retry_at) = run.next_retry() {
                wait = wait.min(retry_at.saturating_duration_since(now));
            }

            if in_flight == 0 {
                sleep(wait).await;
                continue;
            }

            match self.poll(&mut run.pool, wait).await {
                Ok((ready, errored)) => {
                    for id in ready {
                        self.reap(&mut run.pool, id, &mut run.slots).await;
                    }
                    for (id, err) in errored {
                        Self::record_poll_error(&mut run.pool, id, err, &mut run.slots);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "poll_ready failed, failing all in-flight operations");
                    let ids: Vec<ConnectionId> = run
                        .pool
                        .iter()
                        .filter(|h| h.pending_key().is_some())
                        .map(ConnectionHandle::id)
                        .collect();
                    for id in ids {
                        Self::record_poll_error(&mut run.pool, id, err.clone(), &mut run.slots);
                    }
                }
            }
        }

        let BatchRun {
            mut pool,
            retrying,
            slots,
            mut stats,
            ..
        } = run;

        // Retries still waiting at the deadline time out; their connections close with the rest.
        for pending in retrying {
            if let Some(conn) = pending.conn {
                pool.push(ConnectionHandle {
                    conn,
                    state: HandleState::Broken,
                });
            }
        }

        let results: IndexMap<String, RawResult> = slots
            .into_iter()
            .map(|(key, slot)| {
                let result = slot.unwrap_or_else(|| {
                    warn!(key = %key, "Operation timed out");
                    RawResult::timeout()
                });
                (key, result)
            })
            .collect();

        join_all(pool.iter_mut().map(|h| h.conn.close())).await;

        for result in results.values() {
            match result.as_failure().map(|f| f.kind) {
                None => stats.successful += 1,
                Some(FailureKind::Timeout) => stats.timed_out += 1,
                Some(_) => stats.failed += 1,
            }
        }
        stats.duration = started.elapsed();

        info!(
            successful = stats.successful,
            failed = stats.failed,
            timed_out = stats.timed_out,
            retries = stats.retries,
            connections = stats.connections_opened,
            duration_ms = stats.duration.as_millis() as u64,
            "Batch finished"
        );

        BatchOutcome { results, stats }
    }

    /// Start queued operations on available connections until the queue is
    /// empty or the pool is saturated.
    async fn fill(&self, run: &mut BatchRun) {
        while !run.queue.is_empty() && Instant::now() < run.deadline {
            let mut conn = match run.pool.iter().position(ConnectionHandle::is_available) {
                Some(index) => Some(run.pool.swap_remove(index).conn),
                None if run.live() < self.config.max_pool_size => None,
                None => break,
            };
            let Some(op) = run.queue.pop_front() else {
                break;
            };

            let result = self.try_dispatch(&mut conn, &op, &mut run.stats).await;
            self.settle(run, conn, op, 1, result);
        }
    }

    /// Redispatch operations whose backoff has elapsed, on a replacement
    /// connection.
    async fn resume_retries(&self, run: &mut BatchRun) {
        let now = Instant::now();
        if run.retrying.is_empty() || now >= run.deadline {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = mem::take(&mut run.retrying)
            .into_iter()
            .partition(|pending| pending.retry_at <= now);
        run.retrying = waiting;

        for pending in due {
            let PendingRetry {
                op, attempt, conn, ..
            } = pending;
            let mut conn = conn;
            let result = match conn.take() {
                Some(broken) => match self.source.reconnect(broken, &self.config).await {
                    Ok(mut fresh) => {
                        run.stats.connections_opened += 1;
                        let dispatched = fresh.dispatch(op.sql());
                        conn = Some(fresh);
                        dispatched
                    }
                    Err(err) => Err(err),
                },
                None => self.try_dispatch(&mut conn, &op, &mut run.stats).await,
            };
            self.settle(run, conn, op, attempt + 1, result);
        }
    }

    /// Record the outcome of a dispatch attempt: in flight, scheduled for
    /// retry, or failed.
    fn settle(
        &self,
        run: &mut BatchRun,
        conn: Option<Box<dyn AsyncConnection>>,
        op: Operation,
        attempt: u32,
        result: DriverResult<()>,
    ) {
        let err = match result {
            Ok(()) => {
                debug!(key = %op.key(), attempt, "Dispatched");
                if let Some(conn) = conn {
                    run.pool.push(ConnectionHandle {
                        conn,
                        state: HandleState::Dispatched {
                            key: op.key().to_string(),
                        },
                    });
                }
                return;
            }
            Err(err) => err,
        };

        let connection_lost = self.source.is_connection_error(&err);
        let retry = &self.config.retry;
        if connection_lost && retry.should_retry(attempt, &err) {
            let delay = retry.backoff_delay(attempt);
            match Instant::now()
                .checked_add(delay)
                .filter(|retry_at| *retry_at < run.deadline)
            {
                Some(retry_at) => {
                    warn!(
                        key = %op.key(),
                        attempt,
                        code = err.code,
                        delay_ms = delay.as_millis() as u64,
                        "Connection lost, retrying"
                    );
                    retry.notify_retry(attempt, &err, delay);
                    run.stats.retries += 1;
                    run.retrying.push(PendingRetry {
                        op,
                        attempt,
                        conn,
                        retry_at,
                    });
                    return;
                }
                None => debug!(
                    key = %op.key(),
                    delay_ms = delay.as_millis() as u64,
                    "Retry backoff ends after the batch deadline"
                ),
            }
        }

        warn!(key = %op.key(), attempt, code = err.code, error = %err.message, "Dispatch failed");
        if let Some(conn) = conn {
            let mut handle = ConnectionHandle::new(conn);
            if connection_lost {
                handle.state = HandleState::Broken;
            }
            run.pool.push(handle);
        }
        run.slots.insert(op.key().to_string(), Some(err.into()));
    }

    async fn try_dispatch(
        &self,
        conn: &mut Option<Box<dyn AsyncConnection>>,
        op: &Operation,
        stats: &mut ExecutionStats,
    ) -> DriverResult<()> {
        if conn.is_none() {
            let fresh = self.source.connect(&self.config).await?;
            debug!(conn = %fresh.id(), "Opened connection");
            stats.connections_opened += 1;
            *conn = Some(fresh);
        }
        match conn.as_mut() {
            Some(c) => c.dispatch(op.sql()),
            None => Err(DriverError::connection(0, "no connection")),
        }
    }

    async fn poll(
        &self,
        pool: &mut [ConnectionHandle],
        wait: Duration,
    ) -> DriverResult<(Vec<ConnectionId>, Vec<(ConnectionId, DriverError)>)> {
        let mut pending: Vec<&mut dyn AsyncConnection> = Vec::new();
        for handle in pool.iter_mut() {
            if handle.pending_key().is_some() {
                pending.push(handle.conn.as_mut());
            }
        }
        let readiness = self.source.poll_ready(&mut pending, wait).await?;
        Ok((readiness.ready, readiness.errored))
    }

    async fn reap(
        &self,
        pool: &mut [ConnectionHandle],
        id: ConnectionId,
        slots: &mut IndexMap<String, Option<RawResult>>,
    ) {
        let Some(handle) = pool.iter_mut().find(|h| h.id() == id) else {
            return;
        };
        let Some(key) = handle.pending_key().map(str::to_string) else {
            return;
        };

        let result = match handle.conn.reap().await {
            Ok(reaped) => {
                debug!(key = %key, conn = %id, "Reaped");
                handle.state = HandleState::Reaped;
                RawResult::from(reaped)
            }
            Err(err) => {
                warn!(key = %key, code = err.code, error = %err.message, "Statement failed");
                handle.state = if self.source.is_connection_error(&err) {
                    HandleState::Broken
                } else {
                    HandleState::Reaped
                };
                RawResult::from(err)
            }
        };
        slots.insert(key, Some(result));
    }

    fn record_poll_error(
        pool: &mut [ConnectionHandle],
        id: ConnectionId,
        err: DriverError,
        slots: &mut IndexMap<String, Option<RawResult>>,
    ) {
        let Some(handle) = pool.iter_mut().find(|h| h.id() == id) else {
            return;
        };
        if let Some(key) = handle.pending_key().map(str::to_string) {
            warn!(key = %key, code = err.code, error = %err.message, "Connection errored while pending");
            slots.insert(key, Some(err.into()));
        }
        handle.state = HandleState::Broken;
    }
}
