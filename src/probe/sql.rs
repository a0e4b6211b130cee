//! The database surface the probe depends on.
//!
//! `SqlConnector` opens a `SqlSession` from a connection string and an access
//! token; a session runs scalar queries, reports server details and is closed
//! explicitly. Driver errors are normalized into `DbError`, whose category
//! decides how the probe classifies them.

use async_trait::async_trait;

use super::outcome::{ConnectionState, ErrorKind, NativeError, ProbeFailure};
use crate::credential::AccessToken;

/// Driver error category, independent of the concrete driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorCategory {
    /// Connection string could not be parsed
    InvalidDescriptor,
    /// Error token returned by the server (carries native fields)
    Server,
    Io,
    Tls,
    /// Gateway redirect that could not be followed
    Routing,
    TimedOut,
    Protocol,
    Conversion,
    Encoding,
}

impl DbErrorCategory {
    pub fn name(&self) -> &'static str {
        match self {
            DbErrorCategory::InvalidDescriptor => "InvalidDescriptorError",
            DbErrorCategory::Server => "ServerError",
            DbErrorCategory::Io => "IoError",
            DbErrorCategory::Tls => "TlsError",
            DbErrorCategory::Routing => "RoutingError",
            DbErrorCategory::TimedOut => "TimeoutError",
            DbErrorCategory::Protocol => "ProtocolError",
            DbErrorCategory::Conversion => "ConversionError",
            DbErrorCategory::Encoding => "EncodingError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub category: DbErrorCategory,
    pub message: String,
    pub native: Option<NativeError>,
}

impl DbError {
    pub fn new(category: DbErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            native: None,
        }
    }

    pub fn server(message: impl Into<String>, native: NativeError) -> Self {
        Self {
            category: DbErrorCategory::Server,
            message: message.into(),
            native: Some(native),
        }
    }

    pub fn timed_out(operation: &str, secs: u64) -> Self {
        Self::new(
            DbErrorCategory::TimedOut,
            format!("{} timed out after {}s", operation, secs),
        )
    }
}

/// Map a driver error onto the probe's closed error kinds.
///
/// Transport-level categories (server error tokens, I/O, TLS, routing and
/// timeouts) become `ConnectionError` with native fields preserved. A bad
/// connection string is a configuration problem. Everything else keeps its
/// category name.
pub fn classify_db_error(error: DbError) -> ProbeFailure {
    let kind = match error.category {
        DbErrorCategory::InvalidDescriptor => ErrorKind::Configuration,
        DbErrorCategory::Server
        | DbErrorCategory::Io
        | DbErrorCategory::Tls
        | DbErrorCategory::Routing
        | DbErrorCategory::TimedOut => ErrorKind::Connection,
        DbErrorCategory::Protocol | DbErrorCategory::Conversion | DbErrorCategory::Encoding => {
            ErrorKind::Other(error.category.name().to_string())
        }
    };
    ProbeFailure::new(kind, error.message).with_native(error.native)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub database: String,
    pub server_version: String,
}

/// Opens sessions against the database
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(
        &self,
        connection_string: &str,
        token: &AccessToken,
    ) -> Result<Box<dyn SqlSession>, DbError>;
}

/// A single open connection
#[async_trait]
pub trait SqlSession: Send {
    /// Run a query and return the first column of the first row as an integer
    async fn execute_scalar(&mut self, sql: &str, params: &[&str]) -> Result<Option<i64>, DbError>;

    async fn server_info(&mut self) -> Result<ServerInfo, DbError>;

    fn state(&self) -> ConnectionState;

    /// Close the connection. Dropping a session also releases it.
    async fn close(self: Box<Self>) -> Result<(), DbError>;
}
