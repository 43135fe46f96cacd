//! HTTP surface of the ingest service.

use crate::config::ServerConfig;
use crate::service::{IngestError, IngestionService, Upload};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use ndt_pipeline::{content_type_for, ObjectStoreError};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestionService>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let status = match e {
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "Upload failed");
        }
        api_error(status, e.code(), e.to_string())
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ServerConfig, max_upload_bytes: usize) -> Router {
    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .route("/download/*key", get(download))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ndt-ingest"
    }))
}

/// Accept one multipart upload (`file`, optional `jobId`, `ownerId`, `fileId`)
#[instrument(skip(state, multipart))]
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut upload = Upload::default();
    let mut saw_file = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let status = e.status();
        api_error(status, "INVALID_MULTIPART", e.body_text())
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                upload.file_name = field.file_name().unwrap_or("upload").to_string();
                upload.content = field.bytes().await.map_err(|e| {
                    let status = e.status();
                    api_error(status, "INVALID_MULTIPART", e.body_text())
                })?;
                saw_file = true;
            }
            "jobId" | "ownerId" | "fileId" => {
                let value = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, "INVALID_MULTIPART", e.body_text())
                })?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match name.as_str() {
                    "jobId" => upload.job_id = value,
                    "ownerId" => upload.owner_id = value,
                    _ => upload.file_id = value,
                }
            }
            _ => {}
        }
    }

    if !saw_file {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "No file uploaded",
        ));
    }

    let receipt = state.service.ingest(upload).await?;
    Ok(Json(receipt))
}

/// Stream a stored object back to the client
#[instrument(skip(state))]
async fn download(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let body: Bytes = state.service.store().get_object(&key).await.map_err(|e| match e {
        ObjectStoreError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", format!("No object stored under {}", key))
        }
        other => {
            error!(key = %key, error = %other, "Download failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", other.to_string())
        }
    })?;

    Ok((
        [(header::CONTENT_TYPE, content_type_for(&key))],
        Body::from(body),
    )
        .into_response())
}

/// Start the ingest API server; returns when `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ServerConfig,
    max_upload_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config, max_upload_bytes);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingest API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::tests::sample_image;
    use crate::normalizer::ImageNormalizer;
    use axum::http::Request;
    use image::ImageFormat;
    use ndt_pipeline::{MemoryBroker, MemoryObjectStore, ObjectStore, ProcessingMessage};
    use tower::ServiceExt;

    const BOUNDARY: &str = "ndt-test-boundary";

    struct Harness {
        router: Router,
        store: Arc<MemoryObjectStore>,
        broker: Arc<MemoryBroker>,
    }

    fn harness(max_upload_bytes: usize) -> Harness {
        let store = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let service = IngestionService::new(
            store.clone(),
            broker.clone(),
            ImageNormalizer::new(640, 640),
            "ndt.file-processing",
        );
        let router = create_router(
            AppState {
                service: Arc::new(service),
            },
            &ServerConfig::default(),
            max_upload_bytes,
        );
        Harness {
            router,
            store,
            broker,
        }
    }

    fn multipart_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_queues_file() {
        let h = harness(10 * 1024 * 1024);
        let image = sample_image(320, 240, ImageFormat::Png);
        let body = multipart_body(
            Some(("scan.png", &image)),
            &[("jobId", "job-7"), ("fileId", "file-3")],
        );

        let response = h.router.clone().oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "queued");
        let key = json["storageKey"].as_str().unwrap().to_string();
        assert_eq!(json["fileId"], key);
        assert!(h.store.exists(&key).await.unwrap());

        let queued = h.broker.pending("ndt.file-processing");
        let message: ProcessingMessage = queued[0].decode_json().unwrap();
        assert_eq!(message.job_id.as_deref(), Some("job-7"));
        assert_eq!(message.file_id.as_deref(), Some("file-3"));
        assert!(message.owner_id.is_none());
    }

    #[tokio::test]
    async fn test_upload_without_file_is_400() {
        let h = harness(1024 * 1024);
        let body = multipart_body(None, &[("jobId", "job-7")]);

        let response = h.router.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_undecodable_upload_is_400() {
        let h = harness(1024 * 1024);
        let body = multipart_body(Some(("scan.png", b"garbage")), &[]);

        let response = h.router.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_500() {
        let h = harness(10 * 1024 * 1024);
        h.store.set_offline(true);
        let image = sample_image(64, 64, ImageFormat::Png);
        let body = multipart_body(Some(("scan.png", &image)), &[]);

        let response = h.router.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "STORAGE_ERROR");
        assert!(h.broker.pending("ndt.file-processing").is_empty());
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let h = harness(1024);
        let body = multipart_body(Some(("scan.png", &vec![0u8; 4096])), &[]);

        let response = h.router.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_download_round_trip_and_404() {
        let h = harness(1024);
        h.store
            .put_object("uploads/1-a.png", Bytes::from_static(b"png-bytes"), "image/png")
            .await
            .unwrap();

        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/download/uploads/1-a.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"png-bytes");

        let missing = h
            .router
            .oneshot(
                Request::builder()
                    .uri("/download/uploads/missing.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
