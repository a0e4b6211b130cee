//! Probe outcome types.

use std::fmt;

/// Error code, severity class and state from a SQL Server error token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeError {
    pub number: u32,
    pub class: u8,
    pub state: u8,
}

/// Failure categories surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Connection,
    /// Anything else, named after the concrete error category
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Other(name) => name,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => f.write_str("Open"),
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyDetails {
    pub connection_state: ConnectionState,
    pub database: String,
    pub server_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub native: Option<NativeError>,
}

impl ProbeFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            native: None,
        }
    }

    pub fn with_native(mut self, native: Option<NativeError>) -> Self {
        self.native = native;
        self
    }
}

/// Result of one probe run. Exactly one arm is populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy(HealthyDetails),
    /// Reachable but not correctly provisioned
    Degraded {
        reason: String,
        connection_state: ConnectionState,
    },
    Unhealthy(ProbeFailure),
}

impl ProbeOutcome {
    pub fn unhealthy(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProbeOutcome::Unhealthy(ProbeFailure::new(kind, message))
    }

    pub fn status(&self) -> &'static str {
        match self {
            ProbeOutcome::Healthy(_) => "healthy",
            ProbeOutcome::Degraded { .. } => "degraded",
            ProbeOutcome::Unhealthy(_) => "unhealthy",
        }
    }

    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeOutcome::Unhealthy(failure) => Some(failure),
            _ => None,
        }
    }
}
