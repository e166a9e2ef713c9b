//! A MySQL connection that runs one statement at a time in the background.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mysql_async::Conn;
use mysql_async::prelude::*;
use prax_batch::{AsyncConnection, ConnStatus, ConnectionId, DriverError, DriverResult, Reaped};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{CR_COMMANDS_OUT_OF_SYNC, MysqlError, MysqlResult};
use crate::types::row_to_json;

/// A statement task plus a flag it sets before signalling completion.
struct Statement {
    handle: JoinHandle<(Conn, MysqlResult<Reaped>)>,
    done: Arc<AtomicBool>,
}

impl Statement {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.handle.is_finished()
    }
}

enum State {
    Idle(Conn),
    Running(Statement),
    Broken,
    Closed,
}

/// A single MySQL session.
///
/// [`dispatch`](AsyncConnection::dispatch) hands the session to a spawned
/// task that sends the statement and buffers its result; it returns
/// immediately. The task signals the shared [`Notify`] when it finishes so
/// that [`MysqlSource::poll_ready`](crate::MysqlSource) can wake up.
///
/// Dropping a connection with a statement in flight aborts the task.
pub struct MysqlConnection {
    id: ConnectionId,
    state: State,
    notify: Arc<Notify>,
}

impl MysqlConnection {
    pub(crate) fn new(id: ConnectionId, conn: Conn, notify: Arc<Notify>) -> Self {
        Self {
            id,
            state: State::Idle(conn),
            notify,
        }
    }

    /// Check if the session was lost.
    pub fn is_broken(&self) -> bool {
        matches!(self.state, State::Broken | State::Closed)
    }
}

impl std::fmt::Debug for MysqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Idle(_) => "idle",
            State::Running(_) => "running",
            State::Broken => "broken",
            State::Closed => "closed",
        };
        f.debug_struct("MysqlConnection")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}

async fn run_statement(conn: &mut Conn, sql: &str) -> MysqlResult<Reaped> {
    let mut result = conn.query_iter(sql).await?;

    let has_columns = result.columns().is_some_and(|columns| !columns.is_empty());
    let reaped = if has_columns {
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        Reaped::ResultSet(rows.into_iter().map(row_to_json).collect())
    } else {
        Reaped::Affected {
            affected_rows: result.affected_rows(),
            insert_id: result.last_insert_id().unwrap_or(0),
        }
    };

    // Only the first result set is kept; later ones are drained.
    result.drop_result().await?;
    Ok(reaped)
}

#[async_trait]
impl AsyncConnection for MysqlConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn dispatch(&mut self, sql: &str) -> DriverResult<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Idle(mut conn) => {
                let sql = sql.to_string();
                let notify = Arc::clone(&self.notify);
                let done = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&done);
                trace!(connection = %self.id, "Spawning statement task");
                let handle = tokio::spawn(async move {
                    let result = run_statement(&mut conn, &sql).await;
                    flag.store(true, Ordering::Release);
                    notify.notify_one();
                    (conn, result)
                });
                self.state = State::Running(Statement { handle, done });
                Ok(())
            }
            State::Running(statement) => {
                self.state = State::Running(statement);
                Err(DriverError::query(
                    CR_COMMANDS_OUT_OF_SYNC,
                    "Commands out of sync; a statement is already in flight",
                ))
            }
            broken => {
                self.state = broken;
                Err(MysqlError::connection("MySQL server has gone away").into())
            }
        }
    }

    fn status(&mut self) -> ConnStatus {
        match &self.state {
            State::Idle(_) => ConnStatus::Idle,
            State::Running(statement) if statement.is_done() => ConnStatus::Ready,
            State::Running(_) => ConnStatus::Pending,
            State::Broken | State::Closed => ConnStatus::Errored,
        }
    }

    async fn reap(&mut self) -> DriverResult<Reaped> {
        let handle = match mem::replace(&mut self.state, State::Closed) {
            State::Running(statement) => statement.handle,
            other => {
                self.state = other;
                return Err(DriverError::query(
                    CR_COMMANDS_OUT_OF_SYNC,
                    "Commands out of sync; no statement in flight",
                ));
            }
        };

        match handle.await {
            Ok((conn, Ok(reaped))) => {
                self.state = State::Idle(conn);
                Ok(reaped)
            }
            Ok((conn, Err(err))) => {
                if err.is_connection_error() {
                    debug!(connection = %self.id, error = %err, "Session lost while reaping");
                    self.state = State::Broken;
                    drop(conn);
                } else {
                    self.state = State::Idle(conn);
                }
                Err(err.into())
            }
            Err(join_err) => {
                self.state = State::Broken;
                Err(MysqlError::Task(join_err.to_string()).into())
            }
        }
    }

    async fn close(&mut self) {
        match mem::replace(&mut self.state, State::Closed) {
            State::Idle(conn) => {
                if let Err(err) = conn.disconnect().await {
                    debug!(connection = %self.id, error = %err, "Disconnect failed");
                }
            }
            State::Running(statement) => statement.handle.abort(),
            State::Broken | State::Closed => {}
        }
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        if let State::Running(statement) = &self.state {
            debug!(connection = %self.id, "Aborting in-flight statement on drop");
            statement.handle.abort();
        }
    }
}
