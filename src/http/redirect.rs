//! HTTP to HTTPS redirect server.
//!
//! Spawns a lightweight HTTP listener (port 80 unless configured) that
//! permanently redirects every request to the HTTPS listener.

use std::net::SocketAddr;

use axum::http::Uri;
use axum::response::Redirect;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::Host;

/// Spawn an HTTP server that redirects all requests to HTTPS.
///
/// This runs in the background and does not block.
pub fn spawn_redirect_server(http_port: u16, https_port: u16) {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], http_port));

        tracing::info!(http_port, https_port, "Starting HTTP->HTTPS redirect server");

        let app = Router::new().fallback(any(move |Host(host): Host, uri: Uri| async move {
            let target = https_url(&host, &uri, https_port);
            tracing::debug!(from = %uri, to = %target, "Redirecting HTTP to HTTPS");
            Redirect::permanent(&target)
        }));

        match axum_server::bind(addr).serve(app.into_make_service()).await {
            Ok(()) => tracing::debug!("HTTP redirect server stopped"),
            Err(e) => tracing::error!(error = %e, "HTTP redirect server failed"),
        }
    });
}

/// Build the HTTPS URL for a plain HTTP request.
fn https_url(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = host.split(':').next().unwrap_or(host);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_omitted() {
        let uri: Uri = "/health/sql".parse().unwrap();
        assert_eq!(https_url("shop.example.com:80", &uri, 443), "https://shop.example.com/health/sql");
    }

    #[test]
    fn test_custom_port_and_query_kept() {
        let uri: Uri = "/static/site.css?v=2".parse().unwrap();
        assert_eq!(
            https_url("shop.example.com", &uri, 8443),
            "https://shop.example.com:8443/static/site.css?v=2"
        );
    }

}
