//! Error types for the MySQL driver.

use std::fmt;

use prax_batch::retry::{CR_CONN_HOST_ERROR, CR_SERVER_GONE_ERROR, CR_SERVER_LOST};
use prax_batch::{BatchError, DriverError};

/// Result type for MySQL operations.
pub type MysqlResult<T> = Result<T, MysqlError>;

/// Unknown client error.
pub const CR_UNKNOWN_ERROR: i32 = 2000;
/// A statement was sent while another was still in flight.
pub const CR_COMMANDS_OUT_OF_SYNC: i32 = 2014;

/// Server error codes that mean the session itself is gone.
const SERVER_CONNECTION_CODES: [u16; 4] = [
    1053, // ER_SERVER_SHUTDOWN
    1152, // ER_ABORTING_CONNECTION
    1927, // ER_CONNECTION_KILLED
    4031, // ER_CLIENT_INTERACTION_TIMEOUT
];

/// Error type for MySQL operations.
#[derive(Debug)]
pub enum MysqlError {
    /// MySQL driver error.
    Mysql(mysql_async::Error),
    /// Configuration error.
    Config(String),
    /// Could not establish a connection.
    Connect(String),
    /// The connection is not usable.
    Connection(String),
    /// The task running a statement panicked or was cancelled.
    Task(String),
}

impl MysqlError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connect error.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// The MySQL error code: the server code for server errors, a client
    /// code (2xxx) otherwise.
    pub fn code(&self) -> i32 {
        match self {
            Self::Mysql(mysql_async::Error::Server(e)) => i32::from(e.code),
            Self::Mysql(mysql_async::Error::Io(_)) => CR_SERVER_LOST,
            Self::Mysql(mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed)) => {
                CR_SERVER_GONE_ERROR
            }
            Self::Mysql(_) | Self::Config(_) => CR_UNKNOWN_ERROR,
            Self::Connect(_) => CR_CONN_HOST_ERROR,
            Self::Connection(_) => CR_SERVER_GONE_ERROR,
            Self::Task(_) => CR_SERVER_LOST,
        }
    }

    /// Check if the connection is unusable after this error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Mysql(mysql_async::Error::Server(e)) => SERVER_CONNECTION_CODES.contains(&e.code),
            Self::Mysql(mysql_async::Error::Io(_)) => true,
            Self::Mysql(mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed)) => {
                true
            }
            Self::Mysql(_) | Self::Config(_) => false,
            Self::Connect(_) | Self::Connection(_) | Self::Task(_) => true,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Mysql(mysql_async::Error::Server(e)) => e.message.clone(),
            Self::Mysql(e) => e.to_string(),
            Self::Config(msg) | Self::Connect(msg) | Self::Connection(msg) | Self::Task(msg) => {
                msg.clone()
            }
        }
    }
}

impl fmt::Display for MysqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mysql(e) => write!(f, "MySQL error: {}", e),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Connect(msg) => write!(f, "Connect error: {}", msg),
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::Task(msg) => write!(f, "Statement task error: {}", msg),
        }
    }
}

impl std::error::Error for MysqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mysql(e) => Some(e),
            _ => None,
        }
    }
}

impl From<mysql_async::Error> for MysqlError {
    fn from(err: mysql_async::Error) -> Self {
        Self::Mysql(err)
    }
}

impl From<MysqlError> for DriverError {
    fn from(err: MysqlError) -> Self {
        let code = err.code();
        if err.is_connection_error() {
            DriverError::connection(code, err.message())
        } else {
            DriverError::query(code, err.message())
        }
    }
}

impl From<MysqlError> for BatchError {
    fn from(err: MysqlError) -> Self {
        BatchError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::ServerError;

    fn server(code: u16, message: &str) -> MysqlError {
        MysqlError::Mysql(mysql_async::Error::Server(ServerError {
            code,
            message: message.to_string(),
            state: "HY000".to_string(),
        }))
    }

    #[test]
    fn test_error_display() {
        let err = MysqlError::config("invalid charset");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("invalid charset"));
    }

    #[test]
    fn test_server_query_error() {
        let err: DriverError = server(1064, "You have an error in your SQL syntax").into();
        assert!(!err.is_connection_error());
        assert_eq!(err.code, 1064);
        assert_eq!(err.message, "You have an error in your SQL syntax");
    }

    #[test]
    fn test_server_connection_error() {
        let err: DriverError = server(1927, "Connection was killed").into();
        assert!(err.is_connection_error());
        assert_eq!(err.code, 1927);
    }

    #[test]
    fn test_client_errors() {
        let err: DriverError = MysqlError::connect("Connection refused").into();
        assert!(err.is_connection_error());
        assert_eq!(err.code, CR_CONN_HOST_ERROR);

        let err: DriverError = MysqlError::connection("gone").into();
        assert_eq!(err.code, CR_SERVER_GONE_ERROR);

        let err: DriverError = MysqlError::Task("panicked".into()).into();
        assert_eq!(err.code, CR_SERVER_LOST);

        let err: DriverError =
            MysqlError::Mysql(mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed)).into();
        assert!(err.is_connection_error());
        assert_eq!(err.code, CR_SERVER_GONE_ERROR);
    }

    #[test]
    fn test_config_error_into_batch_error() {
        let err: BatchError = MysqlError::config("bad ssl_mode").into();
        assert!(err.is_validation_error());
    }
}
