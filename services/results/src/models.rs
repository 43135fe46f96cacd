//! Jobs, files, results and reports as the results service sees them.
//!
//! Status enums are stored as TEXT columns in their upper-case wire form,
//! so every enum here round-trips through [`std::str::FromStr`].

use chrono::{DateTime, Utc};
use ndt_pipeline::{DetectionItem, ReportFormatRef, ReportScopeRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("Unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

text_enum!(JobStatus, "job status", {
    Queued => "QUEUED",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(FileStatus, "file status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl FileStatus {
    /// Files only move forward. COMPLETED is final; a FAILED file may still
    /// complete when a later delivery succeeds.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        match (*self, next) {
            (Completed, Completed) => true,
            (Completed, _) => false,
            (Failed, Completed | Failed) => true,
            (Failed, _) => false,
            (Processing, Pending) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

text_enum!(Verdict, "verdict", {
    Pass => "PASS",
    Fail => "FAIL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Completed,
    Failed,
}

text_enum!(ReportStatus, "report status", {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// Job status as a pure function of the settled file counts
pub fn derive_job_status(processed: i32, failed: i32, total: i32) -> JobStatus {
    if processed == total {
        JobStatus::Completed
    } else if failed > 0 && processed + failed == total {
        JobStatus::Failed
    } else if processed + failed == 0 {
        JobStatus::Queued
    } else {
        JobStatus::Processing
    }
}

/// `processed / total * 100`, or 0 for an empty job
pub fn progress_percent(processed: i32, total: i32) -> f64 {
    if total <= 0 {
        0.0
    } else {
        f64::from(processed) / f64::from(total) * 100.0
    }
}

/// Counts that cannot belong to the job they were read for
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: {processed} completed + {failed} failed exceeds {total} files")]
pub struct AggregateInconsistency {
    pub job_id: Uuid,
    pub processed: i32,
    pub failed: i32,
    pub total: i32,
}

/// One inspection batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub total_files: i32,
    pub processed_files: i32,
    pub failed_files: i32,
    pub progress: f64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(owner_id: impl Into<String>, total_files: i32, now: DateTime<Utc>) -> Self {
        let status = derive_job_status(0, 0, total_files);
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            total_files,
            processed_files: 0,
            failed_files: 0,
            progress: 0.0,
            status,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: status.is_terminal().then_some(now),
        }
    }

    /// Replace the aggregate with freshly counted values.
    ///
    /// The counts are authoritative; nothing is incremented in place.
    pub fn apply_counts(
        &mut self,
        processed: i32,
        failed: i32,
        now: DateTime<Utc>,
    ) -> Result<(), AggregateInconsistency> {
        if processed < 0 || failed < 0 || processed + failed > self.total_files {
            return Err(AggregateInconsistency {
                job_id: self.id,
                processed,
                failed,
                total: self.total_files,
            });
        }

        let status = derive_job_status(processed, failed, self.total_files);
        if self.started_at.is_none() && processed + failed > 0 {
            self.started_at = Some(now);
        }
        if status.is_terminal() && status != self.status {
            self.completed_at = Some(now);
        }

        self.processed_files = processed;
        self.failed_files = failed;
        self.progress = progress_percent(processed, self.total_files);
        self.status = status;
        self.updated_at = now;
        Ok(())
    }
}

/// A file declared when the job is created
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub name: String,
    #[serde(default)]
    pub storage_key: Option<String>,
}

/// One unit of uploaded content
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub storage_key: Option<String>,
    pub status: FileStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The recorded outcome for one file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub file_id: Uuid,
    #[serde(rename = "overallStatus")]
    pub verdict: Verdict,
    pub defect_count: i32,
    pub confidence: f64,
    pub detections: Vec<DetectionItem>,
    pub processing_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// A result about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub verdict: Verdict,
    pub defect_count: i32,
    pub confidence: f64,
    pub detections: Vec<DetectionItem>,
    pub processing_time_ms: f64,
}

impl NewResult {
    /// FAIL when anything was detected, PASS otherwise.
    ///
    /// The confidence is the first detection's, or 1.0 for a clean image.
    pub fn evaluate(
        job_id: Uuid,
        file_id: Uuid,
        detections: Vec<DetectionItem>,
        processing_time_ms: Option<f64>,
    ) -> Self {
        let (verdict, confidence) = match detections.first() {
            Some(first) => (Verdict::Fail, first.confidence),
            None => (Verdict::Pass, 1.0),
        };
        Self {
            job_id,
            file_id,
            verdict,
            defect_count: i32::try_from(detections.len()).unwrap_or(i32::MAX),
            confidence,
            detections,
            processing_time_ms: processing_time_ms.filter(|t| t.is_finite() && *t >= 0.0).unwrap_or(0.0),
        }
    }

    pub fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> ResultRecord {
        ResultRecord {
            id,
            job_id: self.job_id,
            file_id: self.file_id,
            verdict: self.verdict,
            defect_count: self.defect_count,
            confidence: self.confidence,
            detections: self.detections,
            processing_time_ms: self.processing_time_ms,
            created_at,
        }
    }
}

/// A derived report over the results of one scope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub scope: ReportScopeRef,
    pub format: ReportFormatRef,
    pub status: ReportStatus,
    pub summary: Option<serde_json::Value>,
    pub artifact_key: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl Report {
    pub fn pending(id: Uuid, scope: ReportScopeRef, format: ReportFormatRef, now: DateTime<Utc>) -> Self {
        Self {
            id,
            scope,
            format,
            status: ReportStatus::Pending,
            summary: None,
            artifact_key: None,
            error: None,
            attempts: 0,
            created_at: now,
            generated_at: None,
        }
    }
}

/// Column form of a report scope
pub fn scope_columns(scope: &ReportScopeRef) -> (&'static str, String) {
    match scope {
        ReportScopeRef::Job(id) => ("job", id.to_string()),
        ReportScopeRef::Owner(owner) => ("owner", owner.clone()),
    }
}

pub fn scope_from_columns(kind: &str, id: &str) -> Result<ReportScopeRef, ParseStatusError> {
    let invalid = || ParseStatusError {
        kind: "report scope",
        value: format!("{}:{}", kind, id),
    };
    match kind {
        "job" => Uuid::parse_str(id).map(ReportScopeRef::Job).map_err(|_| invalid()),
        "owner" => Ok(ReportScopeRef::Owner(id.to_string())),
        _ => Err(invalid()),
    }
}

pub fn format_as_str(format: ReportFormatRef) -> &'static str {
    match format {
        ReportFormatRef::Json => "JSON",
        ReportFormatRef::Csv => "CSV",
    }
}

pub fn format_from_str(value: &str) -> Result<ReportFormatRef, ParseStatusError> {
    match value {
        "JSON" => Ok(ReportFormatRef::Json),
        "CSV" => Ok(ReportFormatRef::Csv),
        other => Err(ParseStatusError {
            kind: "report format",
            value: other.to_string(),
        }),
    }
}

/// Totals reported by the system status endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub total_jobs: i64,
    pub active_jobs: i64,
    pub total_results: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str, confidence: f64) -> DetectionItem {
        DetectionItem {
            label: Some(label.to_string()),
            confidence,
            ..Default::default()
        }
    }

    #[test]
    fn test_job_status_function() {
        assert_eq!(derive_job_status(0, 0, 3), JobStatus::Queued);
        assert_eq!(derive_job_status(1, 0, 3), JobStatus::Processing);
        assert_eq!(derive_job_status(0, 1, 3), JobStatus::Processing);
        assert_eq!(derive_job_status(3, 0, 3), JobStatus::Completed);
        assert_eq!(derive_job_status(2, 1, 3), JobStatus::Failed);
        assert_eq!(derive_job_status(0, 0, 0), JobStatus::Completed);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 0), 0.0);
        assert_eq!(progress_percent(1, 4), 25.0);
        assert_eq!(progress_percent(3, 3), 100.0);
    }

    #[test]
    fn test_apply_counts_tracks_lifecycle_timestamps() {
        let created = Utc::now();
        let mut job = Job::new("owner-1", 2, created);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());

        let later = created + chrono::Duration::seconds(5);
        job.apply_counts(1, 0, later).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(later));
        assert!(job.completed_at.is_none());

        let done = later + chrono::Duration::seconds(5);
        job.apply_counts(2, 0, done).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.started_at, Some(later));
        assert_eq!(job.completed_at, Some(done));
    }

    #[test]
    fn test_apply_counts_rejects_overflow() {
        let mut job = Job::new("owner-1", 2, Utc::now());
        let err = job.apply_counts(2, 1, Utc::now()).unwrap_err();
        assert_eq!(err.total, 2);
        assert_eq!(job.processed_files, 0);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_empty_job_is_complete() {
        let job = Job::new("owner-1", 0, Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 0.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_file_transitions_are_forward_only() {
        use FileStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_verdict_uses_first_detection_confidence() {
        let result = NewResult::evaluate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![detection("crack", 0.91), detection("porosity", 0.99)],
            Some(120.0),
        );
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.confidence, 0.91);
        assert_eq!(result.defect_count, 2);

        let clean = NewResult::evaluate(Uuid::new_v4(), Uuid::new_v4(), vec![], None);
        assert_eq!(clean.verdict, Verdict::Pass);
        assert_eq!(clean.confidence, 1.0);
        assert_eq!(clean.processing_time_ms, 0.0);
    }

    #[test]
    fn test_result_serializes_overall_status() {
        let record = NewResult::evaluate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![detection("crack", 0.91)],
            Some(40.0),
        )
        .into_record(Uuid::new_v4(), Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["overallStatus"], "FAIL");
        assert_eq!(json["confidence"], 0.91);
        assert_eq!(json["defectCount"], 1);
        assert!(json.get("verdict").is_none());
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [JobStatus::Queued, JobStatus::Processing, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<FileStatus>().is_err());
        assert_eq!(serde_json::to_value(Verdict::Fail).unwrap(), "FAIL");
    }

    #[test]
    fn test_scope_columns() {
        let job_id = Uuid::new_v4();
        let (kind, id) = scope_columns(&ReportScopeRef::Job(job_id));
        assert_eq!(scope_from_columns(kind, &id).unwrap(), ReportScopeRef::Job(job_id));
        assert!(scope_from_columns("job", "not-a-uuid").is_err());
        assert!(scope_from_columns("site", "x").is_err());
    }
}
