//! Detection capability.
//!
//! Inference is opaque to the pipeline: a [`Detector`] turns image bytes into
//! a list of [`DetectionItem`]s. The production implementation calls a remote
//! inference service over HTTP.

use crate::config::InferenceConfig;
use crate::messages::DetectionItem;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),

    #[error("Image rejected by detector: {0}")]
    InvalidImage(String),
}

impl DetectorError {
    /// Rejected images fail identically on every attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            DetectorError::InvalidImage(_) => false,
            DetectorError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => true,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Detector: Send + Sync {
    /// Run inference on one image
    async fn detect(&self, image: Bytes) -> Result<Vec<DetectionItem>, DetectorError>;
}

/// Models currently loaded by the inference backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelInventory: Send + Sync {
    async fn loaded_models(&self) -> Result<Vec<String>, DetectorError>;
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: String,
    model: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<DetectionItem>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Name(String),
    Info {
        id: String,
        #[serde(default = "loaded_by_default", alias = "isLoaded")]
        loaded: bool,
    },
}

fn loaded_by_default() -> bool {
    true
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default, alias = "loadedModels")]
    models: Vec<ModelEntry>,
}

/// HTTP client for the inference service (`POST /detect`, `GET /models`)
pub struct HttpDetector {
    client: reqwest::Client,
    config: InferenceConfig,
}

impl HttpDetector {
    pub fn new(config: InferenceConfig) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DetectorError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DetectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(DetectorError::InvalidImage(body));
        }
        Err(DetectorError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip(self, image), fields(size_bytes = image.len(), model = %self.config.model_id))]
    async fn detect(&self, image: Bytes) -> Result<Vec<DetectionItem>, DetectorError> {
        let request = DetectRequest {
            image: BASE64.encode(&image),
            model: &self.config.model_id,
        };

        let response = self
            .client
            .post(self.url("detect"))
            .json(&request)
            .send()
            .await
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let parsed: DetectResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

        debug!(detections = parsed.detections.len(), "Inference complete");
        Ok(parsed.detections)
    }
}

#[async_trait]
impl ModelInventory for HttpDetector {
    async fn loaded_models(&self) -> Result<Vec<String>, DetectorError> {
        let response = self
            .client
            .get(self.url("models"))
            .send()
            .await
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let parsed: ModelsResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

        Ok(loaded_model_names(parsed))
    }
}

fn loaded_model_names(response: ModelsResponse) -> Vec<String> {
    response
        .models
        .into_iter()
        .filter_map(|entry| match entry {
            ModelEntry::Name(name) => Some(name),
            ModelEntry::Info { id, loaded: true } => Some(id),
            ModelEntry::Info { .. } => None,
        })
        .collect()
}
