//! Payloads carried on the pipeline queues.
//!
//! All queue messages are JSON with camelCase field names so that the HTTP
//! surfaces and the queues share one wire shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published by ingestion once a normalized upload is durably stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMessage {
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

impl ProcessingMessage {
    pub const MESSAGE_TYPE: &'static str = "file_processing";
}

/// One raw detection returned by the detector.
///
/// Detectors disagree on field names, so the label accepts the common
/// aliases and anything unknown is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectionItem {
    #[serde(
        default,
        alias = "type",
        alias = "defectType",
        alias = "className",
        skip_serializing_if = "Option::is_none"
    )]
    pub label: Option<String>,
    #[serde(
        default,
        rename = "class",
        alias = "classId",
        skip_serializing_if = "Option::is_none"
    )]
    pub class_id: Option<i64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl DetectionItem {
    /// Name used when grouping defects: the label, else `class_<n>`, else `unknown`.
    pub fn defect_name(&self) -> String {
        match (&self.label, self.class_id) {
            (Some(label), _) if !label.trim().is_empty() => label.trim().to_string(),
            (_, Some(class_id)) => format!("class_{}", class_id),
            _ => "unknown".to_string(),
        }
    }
}

/// Outcome of running detection on one file.
///
/// `job_id`/`file_id` stay optional on the wire so a message missing them
/// can be rejected with a precise error instead of failing to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutcome {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub detections: Vec<DetectionItem>,
    #[serde(default, alias = "processingTime")]
    pub processing_time_ms: Option<f64>,
    /// Set when detection failed for this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionOutcome {
    pub const MESSAGE_TYPE: &'static str = "detection_outcome";

    /// Partition key keeping one job's outcomes together
    pub fn partition_key(&self) -> String {
        self.job_id.clone().unwrap_or_default()
    }
}

/// What a report covers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum ReportScopeRef {
    Job(Uuid),
    Owner(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportFormatRef {
    #[default]
    Json,
    Csv,
}

/// Request to render a report, keyed by its report id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub report_id: Uuid,
    pub scope: ReportScopeRef,
    #[serde(default)]
    pub format: ReportFormatRef,
}

impl ReportRequest {
    pub const MESSAGE_TYPE: &'static str = "report_request";

    /// Request for a job's report whose id is derived from the job id,
    /// so repeated completions of the same job collapse onto one report.
    pub fn for_completed_job(job_id: Uuid, format: ReportFormatRef) -> Self {
        Self {
            report_id: Uuid::new_v5(&job_id, b"ndt-report"),
            scope: ReportScopeRef::Job(job_id),
            format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_item_aliases() {
        let items: Vec<DetectionItem> = serde_json::from_str(
            r#"[
                {"type": "crack", "confidence": 0.9},
                {"defectType": "porosity", "confidence": 0.5, "severity": "high"},
                {"class": 3, "confidence": 0.7, "bbox": [1, 2, 3, 4], "extra": true}
            ]"#,
        )
        .unwrap();

        assert_eq!(items[0].defect_name(), "crack");
        assert_eq!(items[1].defect_name(), "porosity");
        assert_eq!(items[1].severity.as_deref(), Some("high"));
        assert_eq!(items[2].defect_name(), "class_3");
        assert!(items[2].bbox.is_some());
    }

    #[test]
    fn test_detection_outcome_accepts_processing_time_alias() {
        let outcome: DetectionOutcome = serde_json::from_str(
            r#"{"jobId": "j", "fileId": "f", "detections": [], "processingTime": 120}"#,
        )
        .unwrap();

        assert_eq!(outcome.processing_time_ms, Some(120.0));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_missing_ids_still_decode() {
        let outcome: DetectionOutcome = serde_json::from_str(r#"{"jobId": "j"}"#).unwrap();
        assert!(outcome.file_id.is_none());
        assert!(outcome.detections.is_empty());
    }

    #[test]
    fn test_report_request_id_is_stable_per_job() {
        let job_id = Uuid::new_v4();
        let first = ReportRequest::for_completed_job(job_id, ReportFormatRef::Json);
        let second = ReportRequest::for_completed_job(job_id, ReportFormatRef::Json);
        assert_eq!(first.report_id, second.report_id);
        assert_ne!(first.report_id, job_id);
    }

    #[test]
    fn test_processing_message_wire_shape() {
        let message = ProcessingMessage {
            storage_key: "uploads/1-a.png".to_string(),
            job_id: Some("job".to_string()),
            owner_id: None,
            file_id: Some("file".to_string()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["storageKey"], "uploads/1-a.png");
        assert!(json.get("ownerId").is_none());
    }
}
