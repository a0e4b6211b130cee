use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::config::ConfigError;
use crate::http::ServerError;

/// Errors returned by request handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Errors that stop the process before it starts serving
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create identity HTTP client: {0}")]
    Credentials(#[from] reqwest::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}
