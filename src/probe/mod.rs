//! SQL dependency probe.
//!
//! `ProbeExecutor::run` checks a `DependencyTarget` in a fixed sequence:
//! configuration present, token acquired, connection opened, liveness query,
//! required table present, server details read. The first failing step
//! decides the outcome. Every I/O step runs under a timeout, the connection
//! is closed on every path, and nothing escapes as an error or panic: the
//! caller always receives a `ProbeOutcome`.

pub mod outcome;
pub mod sql;
pub mod tds;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::instrument;

use crate::config::{DatabaseConfig, SQL_DEPENDENCY_NAME};
use crate::credential::CredentialProvider;

pub use outcome::{ConnectionState, ErrorKind, HealthyDetails, NativeError, ProbeFailure, ProbeOutcome};
pub use sql::{classify_db_error, DbError, DbErrorCategory, ServerInfo, SqlConnector, SqlSession};
pub use tds::TdsConnector;

pub const MISSING_CONNECTION_STRING: &str = "connection string not configured";
pub const MISSING_SCHEMA_OBJECT: &str = "connection succeeded but required schema object is missing";

const LIVENESS_QUERY: &str = "SELECT 1";
const TABLE_EXISTS_QUERY: &str =
    "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = @P1";

/// A downstream dependency to probe, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    pub name: String,
    pub connection_string: String,
    pub token_scope: String,
    pub required_table: Option<String>,
}

impl DependencyTarget {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            name: SQL_DEPENDENCY_NAME.to_string(),
            connection_string: config.resolve_connection_string(),
            token_scope: config.token_scope.clone(),
            required_table: config.required_table().map(str::to_string),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.connection_string.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    pub query: Duration,
}

impl ProbeTimeouts {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_seconds),
            query: Duration::from_secs(config.query_timeout_seconds),
        }
    }
}

/// Runs probes. Cheap to clone; clones share the token cache.
#[derive(Clone)]
pub struct ProbeExecutor {
    credentials: CredentialProvider,
    connector: Arc<dyn SqlConnector>,
    timeouts: ProbeTimeouts,
}

impl ProbeExecutor {
    pub fn new(
        credentials: CredentialProvider,
        connector: Arc<dyn SqlConnector>,
        timeouts: ProbeTimeouts,
    ) -> Self {
        Self {
            credentials,
            connector,
            timeouts,
        }
    }

    /// Probe the target. Always completes with an outcome.
    #[instrument(
        name = "probe.run",
        skip(self, target),
        fields(dependency = %target.name, status, duration_ms)
    )]
    pub async fn run(&self, target: &DependencyTarget) -> ProbeOutcome {
        let start = Instant::now();

        let outcome = match AssertUnwindSafe(self.run_steps(target)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => ProbeOutcome::Unhealthy(panicked(panic)),
        };

        let span = tracing::Span::current();
        span.record("status", outcome.status());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        outcome
    }

    /// Connectivity check only: token, connect and the liveness query.
    ///
    /// Backs the plain `/health` endpoint. The schema check and server details
    /// are left to [`ProbeExecutor::run`].
    #[instrument(name = "probe.ping", skip(self, target), fields(dependency = %target.name))]
    pub async fn ping(&self, target: &DependencyTarget) -> Result<(), ProbeFailure> {
        match AssertUnwindSafe(self.ping_steps(target)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panicked(panic)),
        }
    }

    async fn run_steps(&self, target: &DependencyTarget) -> ProbeOutcome {
        let mut session = match self.open(target).await {
            Ok(session) => session,
            Err(failure) => return ProbeOutcome::Unhealthy(failure),
        };

        let outcome = match self.check_session(session.as_mut(), target).await {
            Ok(outcome) => outcome,
            Err((e, step)) => ProbeOutcome::Unhealthy(failed(e, step)),
        };

        self.close(session).await;
        outcome
    }

    async fn ping_steps(&self, target: &DependencyTarget) -> Result<(), ProbeFailure> {
        let mut session = self.open(target).await?;

        let result = self
            .query(session.execute_scalar(LIVENESS_QUERY, &[]), "liveness query")
            .await
            .map(|_| ())
            .map_err(|(e, step)| failed(e, step));

        self.close(session).await;
        result
    }

    /// Configuration check, token and connect. Failures are logged here.
    async fn open(&self, target: &DependencyTarget) -> Result<Box<dyn SqlSession>, ProbeFailure> {
        if !target.is_configured() {
            tracing::error!(
                error_kind = %ErrorKind::Configuration,
                "SQL connection string is not configured"
            );
            return Err(ProbeFailure::new(ErrorKind::Configuration, MISSING_CONNECTION_STRING));
        }

        let token = match self.credentials.get_token(&target.token_scope).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(
                    error_kind = %ErrorKind::Authentication,
                    scope = %target.token_scope,
                    error = %e,
                    "Authentication failed while acquiring token"
                );
                return Err(ProbeFailure::new(ErrorKind::Authentication, e.to_string()));
            }
        };

        let connect = self.connector.connect(&target.connection_string, &token);
        match tokio::time::timeout(self.timeouts.connect, connect).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(failed(e, "connect")),
            Err(_) => Err(failed(
                DbError::timed_out("connect", self.timeouts.connect.as_secs()),
                "connect",
            )),
        }
    }

    /// Steps that run on an open connection. The caller closes the session.
    async fn check_session(
        &self,
        session: &mut dyn SqlSession,
        target: &DependencyTarget,
    ) -> Result<ProbeOutcome, (DbError, &'static str)> {
        self.query(session.execute_scalar(LIVENESS_QUERY, &[]), "liveness query")
            .await?;

        if let Some(table) = target.required_table.as_deref() {
            let count = self
                .query(session.execute_scalar(TABLE_EXISTS_QUERY, &[table]), "schema check")
                .await?
                .unwrap_or(0);

            if count == 0 {
                tracing::warn!(%table, "SQL connection successful but required table does not exist");
                return Ok(ProbeOutcome::Degraded {
                    reason: MISSING_SCHEMA_OBJECT.to_string(),
                    connection_state: ConnectionState::Open,
                });
            }
        }

        let info = self.query(session.server_info(), "server info").await?;
        if info.database.trim().is_empty() || info.server_version.trim().is_empty() {
            return Err((
                DbError::new(
                    DbErrorCategory::Protocol,
                    "server info query returned an empty database name or server version",
                ),
                "server info",
            ));
        }

        Ok(ProbeOutcome::Healthy(HealthyDetails {
            connection_state: session.state(),
            database: info.database,
            server_version: info.server_version,
        }))
    }

    async fn query<T, F>(&self, fut: F, step: &'static str) -> Result<T, (DbError, &'static str)>
    where
        F: std::future::Future<Output = Result<T, DbError>>,
    {
        match tokio::time::timeout(self.timeouts.query, fut).await {
            Ok(result) => result.map_err(|e| (e, step)),
            Err(_) => Err((DbError::timed_out(step, self.timeouts.query.as_secs()), step)),
        }
    }

    /// Close under the query timeout. The outcome is already decided, so
    /// failures are only logged; a timed-out close drops the session.
    async fn close(&self, session: Box<dyn SqlSession>) {
        match tokio::time::timeout(self.timeouts.query, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Error while closing SQL connection"),
            Err(_) => tracing::warn!(
                timeout_secs = self.timeouts.query.as_secs(),
                "Closing SQL connection timed out"
            ),
        }
    }
}

/// Classify a driver error and log it with full context.
fn failed(error: DbError, step: &str) -> ProbeFailure {
    let native = error.native;
    let category = error.category.name();
    let failure = classify_db_error(error);

    tracing::error!(
        %step,
        error_kind = %failure.kind,
        category,
        error = %failure.message,
        error_number = native.map(|n| n.number),
        error_class = native.map(|n| n.class),
        error_state = native.map(|n| n.state),
        "SQL probe failed"
    );
    failure
}

fn panicked(panic: Box<dyn Any + Send>) -> ProbeFailure {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "probe panicked".to_string());
    tracing::error!(error_kind = "Panic", error = %message, "SQL probe panicked");
    ProbeFailure::new(ErrorKind::Other("Panic".to_string()), message)
}
