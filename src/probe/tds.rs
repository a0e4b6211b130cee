//! SQL Server connector over TDS, authenticated with an Azure AD token.

use async_trait::async_trait;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::outcome::{ConnectionState, NativeError};
use super::sql::{DbError, DbErrorCategory, ServerInfo, SqlConnector, SqlSession};
use crate::credential::AccessToken;

const SERVER_INFO_QUERY: &str =
    "SELECT DB_NAME(), CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128))";

impl From<TdsError> for DbError {
    fn from(error: TdsError) -> Self {
        let message = error.to_string();
        match error {
            TdsError::Server(token) => DbError::server(
                token.message(),
                NativeError {
                    number: token.code(),
                    class: token.class(),
                    state: token.state(),
                },
            ),
            TdsError::Io { .. } => DbError::new(DbErrorCategory::Io, message),
            TdsError::Tls(_) => DbError::new(DbErrorCategory::Tls, message),
            TdsError::Routing { .. } => DbError::new(DbErrorCategory::Routing, message),
            TdsError::Conversion(_) => DbError::new(DbErrorCategory::Conversion, message),
            TdsError::Encoding(_) => DbError::new(DbErrorCategory::Encoding, message),
            _ => DbError::new(DbErrorCategory::Protocol, message),
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(error: std::io::Error) -> Self {
        DbError::new(DbErrorCategory::Io, error.to_string())
    }
}

/// Opens one TDS connection per call; nothing is pooled.
#[derive(Debug, Default, Clone)]
pub struct TdsConnector;

impl TdsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open(config: Config) -> Result<Client<Compat<TcpStream>>, TdsError> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(config, tcp.compat_write()).await
    }
}

#[async_trait]
impl SqlConnector for TdsConnector {
    async fn connect(
        &self,
        connection_string: &str,
        token: &AccessToken,
    ) -> Result<Box<dyn SqlSession>, DbError> {
        let mut config = Config::from_ado_string(connection_string).map_err(|e| {
            DbError::new(
                DbErrorCategory::InvalidDescriptor,
                format!("invalid connection string: {}", e),
            )
        })?;
        config.authentication(AuthMethod::aad_token(token.secret()));

        let client = match Self::open(config.clone()).await {
            // Azure SQL gateways may redirect to the node hosting the database
            Err(TdsError::Routing { host, port }) => {
                tracing::debug!(%host, port, "Following SQL gateway redirect");
                config.host(&host);
                config.port(port);
                Self::open(config).await?
            }
            other => other?,
        };

        Ok(Box::new(TdsSession {
            client: Some(client),
        }))
    }
}

pub struct TdsSession {
    client: Option<Client<Compat<TcpStream>>>,
}

impl TdsSession {
    fn client(&mut self) -> Result<&mut Client<Compat<TcpStream>>, DbError> {
        self.client
            .as_mut()
            .ok_or_else(|| DbError::new(DbErrorCategory::Io, "connection is closed"))
    }
}

fn integer_cell(cell: ColumnData<'static>) -> Option<i64> {
    match cell {
        ColumnData::U8(v) => v.map(i64::from),
        ColumnData::I16(v) => v.map(i64::from),
        ColumnData::I32(v) => v.map(i64::from),
        ColumnData::I64(v) => v,
        _ => None,
    }
}

fn non_null(value: Option<&str>, column: &str) -> Result<String, DbError> {
    value
        .map(str::to_string)
        .ok_or_else(|| DbError::new(DbErrorCategory::Protocol, format!("{} returned NULL", column)))
}

#[async_trait]
impl SqlSession for TdsSession {
    async fn execute_scalar(&mut self, sql: &str, params: &[&str]) -> Result<Option<i64>, DbError> {
        let params: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let row = self.client()?.query(sql, &params).await?.into_row().await?;

        match row.and_then(|row| row.into_iter().next()) {
            None => Ok(None),
            Some(cell) => integer_cell(cell).map(Some).ok_or_else(|| {
                DbError::new(
                    DbErrorCategory::Conversion,
                    format!("'{}' did not return an integer", sql),
                )
            }),
        }
    }

    async fn server_info(&mut self) -> Result<ServerInfo, DbError> {
        let row = self
            .client()?
            .simple_query(SERVER_INFO_QUERY)
            .await?
            .into_row()
            .await?
            .ok_or_else(|| DbError::new(DbErrorCategory::Protocol, "server info query returned no rows"))?;

        Ok(ServerInfo {
            database: non_null(row.try_get::<&str, _>(0)?, "DB_NAME()")?,
            server_version: non_null(row.try_get::<&str, _>(1)?, "ProductVersion")?,
        })
    }

    fn state(&self) -> ConnectionState {
        if self.client.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), DbError> {
        match self.client.take() {
            Some(client) => Ok(client.close().await?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind as IoErrorKind;

    #[test]
    fn test_io_error_maps_to_io_category() {
        let err: DbError = TdsError::Io {
            kind: IoErrorKind::ConnectionRefused,
            message: "connection refused".into(),
        }
        .into();
        assert_eq!(err.category, DbErrorCategory::Io);
        assert!(err.native.is_none());
    }

    #[test]
    fn test_tls_and_routing_errors() {
        let err: DbError = TdsError::Tls("handshake failed".into()).into();
        assert_eq!(err.category, DbErrorCategory::Tls);

        let err: DbError = TdsError::Routing {
            host: "node.database.windows.net".into(),
            port: 11000,
        }
        .into();
        assert_eq!(err.category, DbErrorCategory::Routing);
    }

    #[test]
    fn test_conversion_error_category() {
        let err: DbError = TdsError::Conversion("not an int".into()).into();
        assert_eq!(err.category, DbErrorCategory::Conversion);
    }

    #[test]
    fn test_null_server_property_is_protocol_error() {
        let err = non_null(None, "DB_NAME()").unwrap_err();
        assert_eq!(err.category, DbErrorCategory::Protocol);
        assert_eq!(err.message, "DB_NAME() returned NULL");
        assert_eq!(non_null(Some("stockroom"), "DB_NAME()").unwrap(), "stockroom");
    }

    #[test]
    fn test_integer_cells() {
        assert_eq!(integer_cell(ColumnData::I32(Some(1))), Some(1));
        assert_eq!(integer_cell(ColumnData::I64(Some(7))), Some(7));
        assert_eq!(integer_cell(ColumnData::U8(Some(0))), Some(0));
        assert_eq!(integer_cell(ColumnData::I32(None)), None);
        assert_eq!(integer_cell(ColumnData::Bit(Some(true))), None);
    }
}
