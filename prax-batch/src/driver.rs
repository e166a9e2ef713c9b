//! The connection abstraction the executor drives.
//!
//! A [`ConnectionSource`] opens physical connections and multiplexes readiness
//! across them. Each [`AsyncConnection`] carries at most one dispatched
//! statement at a time: `dispatch` must return without waiting for the server,
//! and the result is collected later with `reap` once `poll_ready` reports the
//! connection ready.
//!
//! Connection-class failures (refused, gone away, lost mid-query) are reported
//! as [`DriverError`]s of kind `Connection` so the executor can apply its retry
//! policy; everything the server rejects is a `Query` error.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BatchConfig, DatabaseKind};
use crate::error::{DriverError, DriverResult};
use crate::operation::Reaped;

/// Identifier of a connection within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Features a connection source advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `dispatch` returns before the statement completes.
    pub nonblocking_dispatch: bool,
}

impl Capabilities {
    /// Capabilities of a source with non-blocking dispatch.
    pub const fn nonblocking() -> Self {
        Self {
            nonblocking_dispatch: true,
        }
    }
}

/// Driver-side status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Nothing in flight.
    Idle,
    /// A statement was dispatched and has not completed.
    Pending,
    /// The dispatched statement completed and can be reaped.
    Ready,
    /// The connection is no longer usable.
    Errored,
}

/// The outcome of one `poll_ready` call.
#[derive(Debug, Default)]
pub struct Readiness {
    /// Connections whose statement can be reaped.
    pub ready: Vec<ConnectionId>,
    /// Connections that failed while waiting.
    pub errored: Vec<(ConnectionId, DriverError)>,
}

impl Readiness {
    /// Check if nothing became ready.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.errored.is_empty()
    }
}

/// A single physical connection able to run one statement at a time.
#[async_trait]
pub trait AsyncConnection: Send {
    /// Identifier, unique among connections of the same source.
    fn id(&self) -> ConnectionId;

    /// Submit a statement without waiting for it to complete.
    fn dispatch(&mut self, sql: &str) -> DriverResult<()>;

    /// Current status.
    fn status(&mut self) -> ConnStatus;

    /// Collect the result of the dispatched statement.
    async fn reap(&mut self) -> DriverResult<Reaped>;

    /// Close the connection, abandoning any statement in flight.
    async fn close(&mut self);
}

/// Creates connections and waits for completions across them.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Name of the backend, used in diagnostics.
    fn backend(&self) -> &'static str;

    /// Check if this source can serve the given database kind.
    fn supports(&self, kind: DatabaseKind) -> bool;

    /// Advertised capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Open a new connection.
    async fn connect(&self, config: &BatchConfig) -> DriverResult<Box<dyn AsyncConnection>>;

    /// Replace a connection that failed with a connection-class error.
    async fn reconnect(
        &self,
        mut broken: Box<dyn AsyncConnection>,
        config: &BatchConfig,
    ) -> DriverResult<Box<dyn AsyncConnection>> {
        broken.close().await;
        self.connect(config).await
    }

    /// Wait up to `wait` for any of `pending` to become ready or fail.
    ///
    /// Returns early as soon as at least one connection is ready; an empty
    /// [`Readiness`] means the wait elapsed.
    async fn poll_ready(
        &self,
        pending: &mut [&mut dyn AsyncConnection],
        wait: Duration,
    ) -> DriverResult<Readiness>;

    /// Check if an error means the connection itself is unusable.
    fn is_connection_error(&self, error: &DriverError) -> bool {
        error.is_connection_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(3).to_string(), "conn#3");
    }

    #[test]
    fn test_capabilities() {
        assert!(!Capabilities::default().nonblocking_dispatch);
        assert!(Capabilities::nonblocking().nonblocking_dispatch);
    }

    #[test]
    fn test_readiness_empty() {
        let mut readiness = Readiness::default();
        assert!(readiness.is_empty());
        readiness.ready.push(ConnectionId(1));
        assert!(!readiness.is_empty());
    }
}
