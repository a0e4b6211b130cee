//! HTTP route handlers.
//!
//! Health routes are never cached. When TLS is enabled every response carries
//! Strict-Transport-Security. Request tracing is enabled via middleware that
//! generates a unique request ID for each incoming request, allowing
//! correlation of all logs within a request (including the probe's own logs).

pub mod health;

use axum::{http::Uri, middleware, routing::get, Router};
use http::header::{HeaderValue, CACHE_CONTROL, STRICT_TRANSPORT_SECURITY};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::{CACHE_CONTROL_HEALTH, STRICT_TRANSPORT_SECURITY as HSTS_VALUE};
use crate::error::AppError;
use crate::http::static_files::create_static_service;
use crate::middleware::request_id_layer;
use crate::state::AppState;

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}

/// Creates the Axum router with all routes and response headers.
pub fn create_router(state: AppState) -> Router {
    // Health checks - no caching, always fresh for probes and pollers
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/sql", get(health::sql))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_HEALTH),
        ));

    let mut router = Router::new().merge(health_routes);

    if let Some(dir) = state.config.http.static_dir.as_deref() {
        router = router.nest_service("/static", create_static_service(dir));
    }

    let tls = &state.config.http.tls;
    let hsts = tls.is_enabled() && tls.hsts;

    let router = router
        .fallback(not_found)
        .with_state(state)
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer));

    if hsts {
        router.layer(SetResponseHeaderLayer::if_not_present(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        ))
    } else {
        router
    }
}
