//! Health check endpoints.
//!
//! `/health` is the connectivity check load balancers poll: it opens a
//! connection and runs `SELECT 1`, answering `Healthy` (200) or `Unhealthy`
//! (503) as plain text. `/health/sql` runs the full dependency probe and always
//! answers 200, with the dependency's state in the JSON body. Neither endpoint
//! requires authentication.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::report::report;
use crate::state::AppState;

/// Database connectivity check.
pub async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.probe.ping(&state.target).await {
        Ok(()) => (StatusCode::OK, "Healthy"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy"),
    }
}

/// Probe the SQL database and report its state.
pub async fn sql(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.probe.run(&state.target).await;
    report(&outcome)
}
