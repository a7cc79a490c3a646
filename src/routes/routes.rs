//! Defines routes for the poetry and image-upload surfaces.
//!
//! ## Structure
//! - **Poetry endpoints**
//!   - `POST   /api/poetry/generate` — generate a poem from an image
//!   - `GET    /api/poetry` — list poems (page, limit, style, userId, sort)
//!   - `GET    /api/poetry/{id}` — fetch one poem
//!   - `PUT    /api/poetry/{id}/feedback` — partial feedback update
//!   - `POST   /api/poetry/{id}/share` — bump the share counter
//!   - `DELETE /api/poetry/{id}` — owner-checked delete
//!
//! - **Image endpoints**
//!   - `POST /api/images/upload` — threshold-routed upload
//!   - `POST /api/images/upload-multipart` — forced chunked upload
//!   - `POST /api/images/upload-url` — fetch a remote image, then store
//!   - `POST /api/images/upload-local` — import from the local import dir
//!   - `GET  /api/images/info/{*key}` — object metadata plus a signed URL

use crate::{
    AppState,
    handlers::{
        health_handlers::{health, readyz},
        image_handlers::{image_info, upload, upload_local, upload_multipart, upload_url},
        poem_handlers::{
            delete_poem, generate_poem, get_poem, list_poems, share_poem, update_feedback,
        },
    },
    services::image_service::MULTIPART_THRESHOLD,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Request-body cap. Axum's default is 2 MB, which would reject uploads
/// before they ever reach the chunked-upload threshold.
const MAX_BODY_BYTES: usize = 4 * MULTIPART_THRESHOLD;

/// Build and return the router for all endpoints.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        // poetry endpoints
        .route("/api/poetry/generate", post(generate_poem))
        .route("/api/poetry", get(list_poems))
        .route("/api/poetry/{id}", get(get_poem).delete(delete_poem))
        .route("/api/poetry/{id}/feedback", put(update_feedback))
        .route("/api/poetry/{id}/share", post(share_poem))
        // image endpoints
        .route("/api/images/upload", post(upload))
        .route("/api/images/upload-multipart", post(upload_multipart))
        .route("/api/images/upload-url", post(upload_url))
        .route("/api/images/upload-local", post(upload_local))
        .route("/api/images/info/{*key}", get(image_info))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        image_service::ImageService,
        inference::{InferenceClient, InferenceConfig},
        object_store::StoreConfig,
        poem_service::PoemService,
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "xOqK8mk3vZ";

    /// Router with the real schema and unreachable store/inference
    /// endpoints, so generation always takes its degraded branches.
    async fn test_app() -> Router {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let sql = include_str!("../../migrations/0001_init.sql");
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        let db = Arc::new(pool);
        let images = Arc::new(
            ImageService::new(StoreConfig {
                base_url: "http://127.0.0.1:9".into(),
                bucket: "poems".into(),
                access_key: "test".into(),
                secret_key: "test".into(),
                timeout_secs: 1,
            })
            .unwrap(),
        );
        let inference = Arc::new(
            InferenceClient::new(InferenceConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: None,
                model: "vision-test".into(),
                timeout_secs: 1,
            })
            .unwrap(),
        );
        let poems = Arc::new(PoemService::new(
            db.clone(),
            images.clone(),
            inference,
            "https://poems.example.com".into(),
        ));
        routes().with_state(AppState {
            db,
            poems,
            images,
            local_import_dir: "./data/import".into(),
        })
    }

    fn file_part(name: &str, filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
        body
    }

    fn text_part(name: &str, value: &str) -> Vec<u8> {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
        .into_bytes()
    }

    fn finish(mut body: Vec<u8>) -> Vec<u8> {
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn generate_accepts_multipart_images_past_two_megabytes() {
        let app = test_app().await;
        let image = vec![0xAB; 3 * 1024 * 1024];
        let body = finish(file_part("image", "big.jpg", &image));

        let response = app
            .oneshot(multipart_request("/api/poetry/generate", body))
            .await
            .unwrap();
        // Storage and inference are unreachable, so this exercises the full
        // degradation chain; the body must not be rejected on size.
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn upload_reads_bodies_past_two_megabytes() {
        let app = test_app().await;
        let image = vec![0xCD; 3 * 1024 * 1024];
        let body = finish(file_part("image", "big.bin", &image));

        let response = app
            .oneshot(multipart_request("/api/images/upload", body))
            .await
            .unwrap();
        // The body is read in full; the unreachable store then surfaces as
        // 503, not as a 400 multipart parse failure.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn generate_without_any_image_source_is_a_400() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/poetry/generate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("no image provided")
        );
    }

    #[tokio::test]
    async fn generate_with_imageless_form_is_a_400() {
        let app = test_app().await;
        let body = finish(text_part("style", "古风"));
        let response = app
            .oneshot(multipart_request("/api/poetry/generate", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
