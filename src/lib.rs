//! Stockroom: product catalogue web service.
//!
//! The service reaches its Azure SQL database with a managed-identity token and
//! exposes `/health/sql`, a probe that reports whether the database is reachable
//! and provisioned.

pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod middleware;
pub mod probe;
pub mod report;
pub mod routes;
pub mod state;

pub use error::{AppError, StartupError};
