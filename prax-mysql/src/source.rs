//! The MySQL [`ConnectionSource`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::Conn;
use prax_batch::{
    AsyncConnection, BatchConfig, Capabilities, ConnStatus, ConnectionSource, DatabaseKind,
    DriverError, DriverResult, Readiness,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::MysqlSettings;
use crate::connection::MysqlConnection;
use crate::error::MysqlError;

const MAX_POLL_WAIT: Duration = Duration::from_secs(86400);

/// Opens `mysql_async` sessions for batch execution.
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use prax_batch::BatchScope;
/// use prax_mysql::MysqlSource;
///
/// let scope = BatchScope::open(Arc::new(MysqlSource::new()), None)?;
/// ```
#[derive(Debug, Default)]
pub struct MysqlSource {
    notify: Arc<Notify>,
    next_id: AtomicU64,
}

impl MysqlSource {
    /// Create a new source.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionSource for MysqlSource {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    fn supports(&self, kind: DatabaseKind) -> bool {
        kind == DatabaseKind::MySql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::nonblocking()
    }

    async fn connect(&self, config: &BatchConfig) -> DriverResult<Box<dyn AsyncConnection>> {
        let settings = MysqlSettings::from_config(config)
            .map_err(|err| DriverError::connection(err.code(), err.to_string()))?;

        let conn = match tokio::time::timeout(
            settings.connect_timeout,
            Conn::new(settings.opts().clone()),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(mysql_async::Error::Io(err))) => {
                return Err(MysqlError::connect(err.to_string()).into());
            }
            Ok(Err(err)) => {
                let err = MysqlError::from(err);
                // Authentication and unknown-database errors still mean no session.
                return Err(DriverError::connection(err.code(), err.to_string()));
            }
            Err(_) => {
                return Err(MysqlError::connect(format!(
                    "timed out after {:?} connecting to {}:{}",
                    settings.connect_timeout, config.hostname, config.port
                ))
                .into());
            }
        };

        let id = prax_batch::ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            connection = %id,
            host = %config.hostname,
            port = config.port,
            "MySQL connection established"
        );
        Ok(Box::new(MysqlConnection::new(
            id,
            conn,
            Arc::clone(&self.notify),
        )))
    }

    async fn poll_ready(
        &self,
        pending: &mut [&mut dyn AsyncConnection],
        wait: Duration,
    ) -> DriverResult<Readiness> {
        let readiness = scan(pending);
        if !readiness.is_empty() {
            return Ok(readiness);
        }

        // Completions store a permit, so one that lands between the scan and
        // this wait is not lost. A permit may be stale or belong to another
        // batch; wait again until something here is ready.
        let now = Instant::now();
        let deadline = now.checked_add(wait).unwrap_or(now + MAX_POLL_WAIT);
        loop {
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                debug!(pending = pending.len(), ?wait, "Poll wait elapsed");
                return Ok(scan(pending));
            }
            let readiness = scan(pending);
            if !readiness.is_empty() {
                return Ok(readiness);
            }
        }
    }
}

fn scan(pending: &mut [&mut dyn AsyncConnection]) -> Readiness {
    let mut readiness = Readiness::default();
    for conn in pending.iter_mut() {
        match conn.status() {
            ConnStatus::Ready => readiness.ready.push(conn.id()),
            ConnStatus::Errored => readiness.errored.push((
                conn.id(),
                MysqlError::connection("MySQL server has gone away").into(),
            )),
            ConnStatus::Idle | ConnStatus::Pending => {}
        }
    }
    readiness
}
