//! Report generation from recorded results.
//!
//! The consumer is read-only over results. A request whose report is
//! already COMPLETED is acknowledged without work; a failed generation marks
//! the report FAILED and hands the message back for redelivery.

use crate::models::{format_as_str, Report, ReportStatus, ResultRecord, Verdict};
use crate::store::{JobStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ndt_pipeline::{
    ConsumerError, IncomingMessage, MessageHandler, ObjectStore, ObjectStoreError,
    ReportFormatRef, ReportRequest, ReportScopeRef,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to store report artifact: {0}")]
    Artifact(#[from] ObjectStoreError),

    #[error("Failed to render report: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceDistribution {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectCount {
    #[serde(rename = "type")]
    pub defect_type: String,
    pub count: u64,
}

/// Aggregate numbers over every result in a scope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_inspections: u64,
    pub passed_inspections: u64,
    pub failed_inspections: u64,
    /// Files whose detection failed outright and produced no result
    pub failed_files: i64,
    pub pass_rate: f64,
    pub defect_distribution: BTreeMap<String, u64>,
    pub severity_distribution: BTreeMap<String, u64>,
    pub critical_defects_found: u64,
    pub confidence_distribution: ConfidenceDistribution,
    pub avg_processing_time_ms: f64,
    pub avg_defects_per_image: f64,
    pub most_common_defect: Option<DefectCount>,
    pub recommendations: Vec<String>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u64), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Summarize results; every ratio is 0 for an empty scope
pub fn summarize(results: &[ResultRecord], failed_files: i64) -> ReportSummary {
    let total = results.len() as u64;
    let passed = results.iter().filter(|r| r.verdict == Verdict::Pass).count() as u64;
    let failed = total - passed;

    let mut defect_distribution: BTreeMap<String, u64> = BTreeMap::new();
    let mut severity_distribution: BTreeMap<String, u64> = BTreeMap::new();
    let mut confidences = Vec::new();
    for detection in results.iter().flat_map(|r| r.detections.iter()) {
        *defect_distribution.entry(detection.defect_name()).or_default() += 1;
        if let Some(severity) = &detection.severity {
            *severity_distribution.entry(severity.to_lowercase()).or_default() += 1;
        }
        confidences.push(detection.confidence);
    }
    let defect_total: u64 = defect_distribution.values().sum();

    let confidence_distribution = if confidences.is_empty() {
        ConfidenceDistribution {
            min: 0.0,
            max: 0.0,
            avg: 0.0,
        }
    } else {
        ConfidenceDistribution {
            min: confidences.iter().copied().fold(f64::INFINITY, f64::min),
            max: confidences.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg: mean(confidences.iter().copied()),
        }
    };

    // Highest count wins; ties go to the alphabetically first name
    let most_common_defect = defect_distribution
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(name, count)| DefectCount {
            defect_type: name.clone(),
            count: *count,
        });

    let mut summary = ReportSummary {
        total_inspections: total,
        passed_inspections: passed,
        failed_inspections: failed,
        failed_files,
        pass_rate: if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64 * 100.0
        },
        critical_defects_found: severity_distribution.get("critical").copied().unwrap_or(0),
        defect_distribution,
        severity_distribution,
        confidence_distribution,
        avg_processing_time_ms: mean(results.iter().map(|r| r.processing_time_ms)),
        avg_defects_per_image: if total == 0 {
            0.0
        } else {
            defect_total as f64 / total as f64
        },
        most_common_defect,
        recommendations: Vec::new(),
    };
    summary.recommendations = recommendations(&summary);
    summary
}

fn recommendations(summary: &ReportSummary) -> Vec<String> {
    let mut out = Vec::new();
    if summary.total_inspections == 0 {
        return out;
    }

    if summary.pass_rate < 50.0 {
        out.push("Pass rate is below 50%. Review the manufacturing process and quality control measures.".to_string());
    } else if summary.pass_rate < 80.0 {
        out.push("Pass rate is below 80%. Consider process improvements to reduce the defect rate.".to_string());
    }
    if summary.critical_defects_found > 0 {
        out.push(format!(
            "Found {} critical defects. Affected components need immediate action.",
            summary.critical_defects_found
        ));
    }
    if summary.confidence_distribution.avg > 0.0 && summary.confidence_distribution.avg < 0.7 {
        out.push("Average detection confidence is low. Check image quality or detection parameters.".to_string());
    }
    if summary.avg_processing_time_ms > 5000.0 {
        out.push("Average processing time exceeds 5 seconds. Consider smaller images or batches.".to_string());
    }
    if let Some(common) = &summary.most_common_defect {
        if common.count as f64 > summary.total_inspections as f64 * 0.3 {
            out.push(format!(
                "\"{}\" defects appear in over 30% of inspections. Investigate the root cause.",
                common.defect_type
            ));
        }
    }
    out
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonArtifact<'a> {
    report_id: Uuid,
    scope: &'a ReportScopeRef,
    generated_at: chrono::DateTime<Utc>,
    summary: &'a ReportSummary,
    results: &'a [ResultRecord],
}

pub fn render_json(
    report_id: Uuid,
    scope: &ReportScopeRef,
    summary: &ReportSummary,
    results: &[ResultRecord],
) -> Result<Vec<u8>, ReportError> {
    serde_json::to_vec_pretty(&JsonArtifact {
        report_id,
        scope,
        generated_at: Utc::now(),
        summary,
        results,
    })
    .map_err(|e| ReportError::Render(e.to_string()))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One row per result; defects are `name:confidence` pairs joined by `;`
pub fn render_csv(results: &[ResultRecord]) -> Vec<u8> {
    let mut out = String::from(
        "result_id,job_id,file_id,overall_status,defect_count,confidence,processing_time_ms,defects,created_at\n",
    );
    for result in results {
        let defects = result
            .detections
            .iter()
            .map(|d| format!("{}:{:.3}", d.defect_name(), d.confidence))
            .collect::<Vec<_>>()
            .join(";");
        // Writing to a String cannot fail
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{}",
            result.id,
            result.job_id,
            result.file_id,
            result.verdict,
            result.defect_count,
            result.confidence,
            result.processing_time_ms,
            csv_field(&defects),
            result.created_at.to_rfc3339(),
        );
    }
    out.into_bytes()
}

fn extension(format: ReportFormatRef) -> (&'static str, &'static str) {
    match format {
        ReportFormatRef::Json => ("json", "application/json"),
        ReportFormatRef::Csv => ("csv", "text/csv"),
    }
}

/// What one report request ended up doing
#[derive(Debug, Clone)]
pub enum ReportRun {
    Generated(Report),
    AlreadyCompleted(Report),
}

pub struct ReportGenerator {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    artifact_prefix: String,
}

impl ReportGenerator {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        artifact_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            artifact_prefix: artifact_prefix.into(),
        }
    }

    pub fn artifact_key(&self, report_id: Uuid, format: ReportFormatRef) -> String {
        format!(
            "{}/{}.{}",
            self.artifact_prefix.trim_end_matches('/'),
            report_id,
            extension(format).0
        )
    }

    #[instrument(skip(self, request), fields(report_id = %request.report_id, format = format_as_str(request.format)))]
    pub async fn generate(&self, request: &ReportRequest) -> Result<ReportRun, ReportError> {
        let report = self.store.begin_report_attempt(request).await?;
        if report.status == ReportStatus::Completed {
            info!("Report already generated");
            return Ok(ReportRun::AlreadyCompleted(report));
        }

        match self.build(request).await {
            Ok((summary, key)) => {
                let report = self
                    .store
                    .mark_report_completed(request.report_id, summary, &key)
                    .await?;
                metrics::counter!("results.reports.generated").increment(1);
                info!(artifact_key = %key, attempts = report.attempts, "Report generated");
                Ok(ReportRun::Generated(report))
            }
            Err(e) => {
                metrics::counter!("results.reports.failed").increment(1);
                if let Err(mark_err) = self.store.mark_report_failed(request.report_id, &e.to_string()).await {
                    error!(error = %mark_err, "Failed to mark report as failed");
                }
                Err(e)
            }
        }
    }

    async fn build(&self, request: &ReportRequest) -> Result<(serde_json::Value, String), ReportError> {
        let snapshot = self.store.scope_snapshot(&request.scope).await?;
        let summary = summarize(&snapshot.results, snapshot.failed_files);

        let body = match request.format {
            ReportFormatRef::Json => {
                render_json(request.report_id, &request.scope, &summary, &snapshot.results)?
            }
            ReportFormatRef::Csv => render_csv(&snapshot.results),
        };

        let key = self.artifact_key(request.report_id, request.format);
        self.objects
            .put_object(&key, Bytes::from(body), extension(request.format).1)
            .await?;

        let summary = serde_json::to_value(&summary).map_err(|e| ReportError::Render(e.to_string()))?;
        Ok((summary, key))
    }
}

/// Consumes the report-generation queue
pub struct ReportConsumer {
    generator: Arc<ReportGenerator>,
}

impl ReportConsumer {
    pub fn new(generator: Arc<ReportGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl MessageHandler for ReportConsumer {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let request: ReportRequest = message.decode_json()?;
        self.generator
            .generate(&request)
            .await
            .map(|_| ())
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))
    }
}
