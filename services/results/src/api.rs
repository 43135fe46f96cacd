//! HTTP surface of the results service.

use crate::config::ApiConfig;
use crate::health::HealthAggregator;
use crate::models::NewFile;
use crate::progress::{JobProgressEvent, ProgressBroadcaster};
use crate::recorder::{RecordError, RecordOutcome, ResultRecorder};
use crate::store::{JobStore, StoreError};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use ndt_pipeline::{
    DetectionOutcome, MessageBroker, OutgoingMessage, ReportFormatRef, ReportRequest,
    ReportScopeRef,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub recorder: Arc<ResultRecorder>,
    pub broker: Arc<dyn MessageBroker>,
    pub health: Arc<HealthAggregator>,
    pub progress: ProgressBroadcaster,
    pub report_queue: String,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub code: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                message: message.into(),
                code: code.to_string(),
            },
        }),
    )
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if e.is_not_found() {
            return api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string());
        }
        error!(error = %e, "Store request failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string())
    }
}

impl From<RecordError> for ApiError {
    fn from(e: RecordError) -> Self {
        let status = match e {
            RecordError::MissingIds => StatusCode::BAD_REQUEST,
            RecordError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "Detection processing error");
        }
        api_error(status, e.code(), e.to_string())
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
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
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:job_id", get(get_job))
        .route("/api/v1/jobs/:job_id/results", get(get_job_results))
        .route("/api/v1/jobs/:job_id/events", get(job_events))
        .route("/api/v1/detection/process", post(process_detection))
        .route("/api/v1/reports", post(request_report))
        .route("/api/v1/reports/:report_id", get(get_report))
        .route("/api/v1/system/status", get(system_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "results-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub owner_id: String,
    #[serde(default)]
    pub files: Vec<NewFile>,
}

#[instrument(skip(state, request), fields(owner_id = %request.owner_id, files = request.files.len()))]
async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.owner_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "ownerId is required",
        ));
    }
    if request.files.iter().any(|f| f.name.trim().is_empty()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "Every file needs a name",
        ));
    }

    let (job, files) = state
        .store
        .create_job(request.owner_id.trim(), request.files)
        .await?;
    info!(job_id = %job.id, total_files = job.total_files, "Job created");

    Ok((
        StatusCode::CREATED,
        ok(serde_json::json!({ "job": job, "files": files })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListQuery {
    pub owner_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .store
        .list_jobs(params.owner_id, params.limit.clamp(1, 500))
        .await?;
    Ok(ok(jobs))
}

#[instrument(skip(state))]
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;
    let files = state.store.get_job_files(job_id).await?;
    Ok(ok(serde_json::json!({ "job": job, "files": files })))
}

#[instrument(skip(state))]
async fn get_job_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_job(job_id).await?.is_none() {
        return Err(StoreError::JobNotFound(job_id).into());
    }
    let results = state.store.get_job_results(job_id).await?;
    Ok(ok(results))
}

/// Current aggregate followed by live updates, ending after the job settles
async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    // Subscribe before reading the snapshot so no update in between is lost
    let live = state.progress.subscribe_job(job_id);
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

    let snapshot = JobProgressEvent::from_job(&job, None);
    let events = stream::unfold(
        (Some(snapshot), Box::pin(live), false),
        |(pending, mut live, finished)| async move {
            if finished {
                return None;
            }
            let event = match pending {
                Some(event) => event,
                None => live.next().await?,
            };
            let finished = event.status.is_terminal();
            Some((event, (None, live, finished)))
        },
    )
    .map(|event| Event::default().event("progress").json_data(event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Record one detection outcome posted by a detection worker
#[instrument(skip(state, payload))]
async fn process_detection(
    State(state): State<AppState>,
    payload: Result<Json<DetectionOutcome>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(outcome) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Malformed detection payload");
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_PAYLOAD",
            rejection.body_text(),
        )
    })?;

    // `data` is the Result itself; the job aggregate rides alongside
    let body = match state.recorder.record(outcome).await? {
        RecordOutcome::Completed(completion) => serde_json::json!({
            "success": true,
            "data": completion.result,
            "job": completion.job,
            "duplicate": completion.duplicate,
        }),
        RecordOutcome::Failed(failure) => serde_json::json!({
            "success": true,
            "data": failure.file,
            "job": failure.job,
            "ignored": failure.ignored,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequestBody {
    pub job_id: Option<String>,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub format: ReportFormatRef,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQueued {
    pub status: &'static str,
    pub report_id: Uuid,
}

#[instrument(skip(state, body))]
async fn request_report(
    State(state): State<AppState>,
    Json(body): Json<ReportRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = match (body.job_id.as_deref().map(str::trim), body.owner_id.as_deref().map(str::trim)) {
        (Some(job_id), _) if !job_id.is_empty() => {
            let job_id = Uuid::parse_str(job_id).map_err(|_| {
                api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "jobId is not a valid id")
            })?;
            if state.store.get_job(job_id).await?.is_none() {
                return Err(StoreError::JobNotFound(job_id).into());
            }
            ReportScopeRef::Job(job_id)
        }
        (_, Some(owner_id)) if !owner_id.is_empty() => ReportScopeRef::Owner(owner_id.to_string()),
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "jobId or ownerId is required",
            ))
        }
    };

    let request = ReportRequest {
        report_id: Uuid::new_v4(),
        scope,
        format: body.format,
    };
    state.store.create_report_if_absent(&request).await?;

    let message = OutgoingMessage::new_json(&state.report_queue, &request)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_ERROR", e.to_string()))?
        .with_key(request.report_id.to_string())
        .with_message_type(ReportRequest::MESSAGE_TYPE);
    if let Err(e) = state.broker.publish(message).await {
        error!(report_id = %request.report_id, error = %e, "Failed to queue report request");
        // Nothing will ever pick this report up
        if let Err(mark) = state
            .store
            .mark_report_failed(request.report_id, &format!("queueing failed: {}", e))
            .await
        {
            warn!(report_id = %request.report_id, error = %mark, "Failed to mark unqueued report");
        }
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUEUE_ERROR",
            e.to_string(),
        ));
    }

    info!(report_id = %request.report_id, "Report queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(ReportQueued {
            status: "queued",
            report_id: request.report_id,
        }),
    ))
}

async fn get_report(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .store
        .get_report(report_id)
        .await?
        .ok_or(StoreError::ReportNotFound(report_id))?;
    Ok(ok(report))
}

/// Always 200; outages show up as degraded entries in the snapshot
async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.health.snapshot().await)
}

/// Start the results API server; returns when `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting results API server");

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
    use crate::models::ReportStatus;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::response::Response;
    use ndt_pipeline::{DetectorError, MemoryBroker, MemoryObjectStore, ModelInventory};
    use std::time::Duration;
    use tower::ServiceExt;

    const REPORT_QUEUE: &str = "ndt.report-generation";

    struct OneModel;

    #[async_trait]
    impl ModelInventory for OneModel {
        async fn loaded_models(&self) -> Result<Vec<String>, DetectorError> {
            Ok(vec!["yolov8-ndt".to_string()])
        }
    }

    struct Harness {
        router: Router,
        store: Arc<MemoryJobStore>,
        objects: Arc<MemoryObjectStore>,
        broker: Arc<MemoryBroker>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let progress = ProgressBroadcaster::new(64);
        let recorder = Arc::new(
            ResultRecorder::new(store.clone(), broker.clone(), progress.clone(), REPORT_QUEUE)
                .with_transaction_retries(2, Duration::from_millis(1)),
        );
        let health = Arc::new(HealthAggregator::new(
            store.clone(),
            objects.clone(),
            broker.clone(),
            Arc::new(OneModel),
            progress.clone(),
            vec![REPORT_QUEUE.to_string()],
        ));
        let state = AppState {
            store: store.clone(),
            recorder,
            broker: broker.clone(),
            health,
            progress,
            report_queue: REPORT_QUEUE.to_string(),
        };
        Harness {
            router: create_router(state, &ApiConfig::default()),
            store,
            objects,
            broker,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_job(h: &Harness, files: usize) -> (Uuid, Vec<Uuid>) {
        let files: Vec<_> = (0..files)
            .map(|i| serde_json::json!({ "name": format!("weld-{}.png", i) }))
            .collect();
        let body = serde_json::json!({ "ownerId": "inspector-1", "files": files }).to_string();
        let response = h
            .router
            .clone()
            .oneshot(post_json("/api/v1/jobs", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_body(response).await;
        let job_id = json["data"]["job"]["id"].as_str().unwrap().parse().unwrap();
        let file_ids = json["data"]["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["id"].as_str().unwrap().parse().unwrap())
            .collect();
        (job_id, file_ids)
    }

    #[tokio::test]
    async fn test_process_detection_records_result() {
        let h = harness();
        let (job_id, files) = create_job(&h, 2).await;

        let body = serde_json::json!({
            "jobId": job_id,
            "fileId": files[0],
            "detections": [{ "type": "porosity", "confidence": 0.91 }],
            "processingTime": 120.5
        })
        .to_string();
        let response = h
            .router
            .clone()
            .oneshot(post_json("/api/v1/detection/process", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["overallStatus"], "FAIL");
        assert_eq!(json["data"]["confidence"], 0.91);
        assert_eq!(json["data"]["defectCount"], 1);
        assert_eq!(json["data"]["fileId"], files[0].to_string());
        assert_eq!(json["job"]["processedFiles"], 1);
        assert_eq!(json["job"]["status"], "PROCESSING");
        assert_eq!(json["job"]["progress"], 50.0);
        assert_eq!(json["duplicate"], false);
    }

    #[tokio::test]
    async fn test_clean_image_passes_with_full_confidence() {
        let h = harness();
        let (job_id, files) = create_job(&h, 1).await;

        let body = serde_json::json!({
            "jobId": job_id,
            "fileId": files[0],
            "detections": [],
            "processingTime": 42.0
        })
        .to_string();
        let first = h
            .router
            .clone()
            .oneshot(post_json("/api/v1/detection/process", &body))
            .await
            .unwrap();
        let first = json_body(first).await;
        assert_eq!(first["data"]["overallStatus"], "PASS");
        assert_eq!(first["data"]["confidence"], 1.0);
        assert_eq!(first["job"]["status"], "COMPLETED");

        // Redelivery answers with the same Result
        let second = h
            .router
            .oneshot(post_json("/api/v1/detection/process", &body))
            .await
            .unwrap();
        let second = json_body(second).await;
        assert_eq!(second["data"]["id"], first["data"]["id"]);
        assert_eq!(second["duplicate"], true);
    }

    #[tokio::test]
    async fn test_missing_file_id_is_400_without_mutation() {
        let h = harness();
        let (job_id, _) = create_job(&h, 1).await;

        let body = serde_json::json!({ "jobId": job_id, "detections": [] }).to_string();
        let response = h
            .router
            .clone()
            .oneshot(post_json("/api/v1/detection/process", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "MISSING_IDS");
        assert_eq!(json["error"]["message"], "Job ID and File ID required");

        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.processed_files, 0);
    }

    #[tokio::test]
    async fn test_unknown_file_is_process_error() {
        let h = harness();
        let (job_id, _) = create_job(&h, 1).await;

        let body = serde_json::json!({ "jobId": job_id, "fileId": Uuid::new_v4() }).to_string();
        let response = h
            .router
            .oneshot(post_json("/api/v1/detection/process", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"]["code"], "PROCESS_ERROR");
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_payload() {
        let h = harness();
        let response = h
            .router
            .oneshot(post_json("/api/v1/detection/process", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_report_request_queued() {
        let h = harness();
        let (job_id, _) = create_job(&h, 1).await;

        let body = serde_json::json!({ "jobId": job_id, "format": "CSV" }).to_string();
        let response = h
            .router
            .clone()
            .oneshot(post_json("/api/v1/reports", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["status"], "queued");
        let report_id: Uuid = json["reportId"].as_str().unwrap().parse().unwrap();

        let queued = h.broker.pending(REPORT_QUEUE);
        let request: ReportRequest = queued[0].decode_json().unwrap();
        assert_eq!(request.report_id, report_id);
        assert_eq!(request.scope, ReportScopeRef::Job(job_id));
        assert_eq!(request.format, ReportFormatRef::Csv);

        let response = h
            .router
            .oneshot(get(&format!("/api/v1/reports/{}", report_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["status"], "PENDING");
    }

    #[tokio::test]
    async fn test_unqueued_report_is_marked_failed() {
        let h = harness();
        let (job_id, _) = create_job(&h, 1).await;
        h.broker.set_offline(true);

        let body = serde_json::json!({ "jobId": job_id }).to_string();
        let response = h
            .router
            .oneshot(post_json("/api/v1/reports", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"]["code"], "QUEUE_ERROR");

        let reports = h.store.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap().starts_with("queueing failed"));
    }

    #[tokio::test]
    async fn test_report_request_needs_scope() {
        let h = harness();
        let response = h
            .router
            .oneshot(post_json("/api/v1/reports", r#"{"format":"JSON"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.broker.pending(REPORT_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let h = harness();
        let response = h
            .router
            .oneshot(get(&format!("/api/v1/jobs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_system_status_reports_degraded_object_store() {
        let h = harness();
        h.objects.set_offline(true);

        let response = h.router.oneshot(get("/api/v1/system/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["data"]["status"], "degraded");
        assert_eq!(json["data"]["services"]["objectStore"]["status"], "unhealthy");
        assert_eq!(json["data"]["services"]["broker"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_system_status_survives_database_outage() {
        let h = harness();
        h.store.set_offline(true);

        let response = h.router.oneshot(get("/api/v1/system/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "degraded");
        assert_eq!(json["data"]["services"]["database"]["status"], "unhealthy");
        assert_eq!(json["data"]["services"]["broker"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_events_for_finished_job_end_after_snapshot() {
        let h = harness();
        let (job_id, _) = create_job(&h, 0).await;

        let response = h
            .router
            .oneshot(get(&format!("/api/v1/jobs/{}/events", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: progress"));
        assert!(text.contains("\"status\":\"COMPLETED\""));
    }
}
