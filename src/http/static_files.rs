//! Static file serving.

use tower_http::services::ServeDir;

/// Serve files from `dir`, answering 404 for anything missing.
pub fn create_static_service(dir: &str) -> ServeDir {
    ServeDir::new(dir).append_index_html_on_directories(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_serves_existing_file_and_404s_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.css"), "body {}").unwrap();
        let service = create_static_service(dir.path().to_str().unwrap());

        let response = service
            .clone()
            .oneshot(Request::get("/site.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = service
            .oneshot(Request::get("/missing.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
