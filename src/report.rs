//! Maps probe outcomes to the health endpoint's JSON payload.
//!
//! The HTTP status is always 200: a probe that ran and found the database
//! unhealthy is a successful request. Monitoring reads `status` from the body.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::probe::ProbeOutcome;

pub const HEALTHY_MESSAGE: &str = "SQL connection successful";

/// Response body for `GET /health/sql`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthReport {
    #[serde(rename_all = "camelCase")]
    Healthy {
        message: String,
        connection_state: String,
        database: String,
        server_version: String,
    },
    #[serde(rename_all = "camelCase")]
    Degraded {
        message: String,
        connection_state: String,
    },
    #[serde(rename_all = "camelCase")]
    Unhealthy {
        error: String,
        error_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_number: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_class: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<u8>,
    },
}

impl From<&ProbeOutcome> for HealthReport {
    fn from(outcome: &ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Healthy(details) => HealthReport::Healthy {
                message: HEALTHY_MESSAGE.to_string(),
                connection_state: details.connection_state.to_string(),
                database: details.database.clone(),
                server_version: details.server_version.clone(),
            },
            ProbeOutcome::Degraded {
                reason,
                connection_state,
            } => HealthReport::Degraded {
                message: reason.clone(),
                connection_state: connection_state.to_string(),
            },
            ProbeOutcome::Unhealthy(failure) => HealthReport::Unhealthy {
                error: failure.message.clone(),
                error_type: failure.kind.to_string(),
                error_number: failure.native.map(|n| n.number),
                error_class: failure.native.map(|n| n.class),
                state: failure.native.map(|n| n.state),
            },
        }
    }
}

/// Build the health response and log anything that is not healthy.
pub fn report(outcome: &ProbeOutcome) -> (StatusCode, Json<HealthReport>) {
    match outcome {
        ProbeOutcome::Healthy(_) => {}
        ProbeOutcome::Degraded { reason, .. } => {
            tracing::warn!(status = "degraded", %reason, "SQL health check degraded");
        }
        ProbeOutcome::Unhealthy(failure) => {
            tracing::error!(
                status = "unhealthy",
                error_type = %failure.kind,
                error = %failure.message,
                error_number = failure.native.map(|n| n.number),
                error_class = failure.native.map(|n| n.class),
                error_state = failure.native.map(|n| n.state),
                "SQL health check failed"
            );
        }
    }

    (StatusCode::OK, Json(HealthReport::from(outcome)))
}
