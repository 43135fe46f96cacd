//! Durable state of jobs, files, results and reports.
//!
//! Every mutation that touches a job aggregate runs as one unit: either the
//! file transition, the result and the recomputed aggregate all become
//! visible, or none of them do.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use crate::models::{
    AggregateInconsistency, FileRecord, Job, NewFile, NewResult, ParseStatusError,
    PipelineCounters, Report, ResultRecord,
};
use async_trait::async_trait;
use ndt_pipeline::{ReportRequest, ReportScopeRef};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("File {file_id} not found in job {job_id}")]
    FileNotFound { job_id: Uuid, file_id: Uuid },

    #[error("Report {0} not found")]
    ReportNotFound(Uuid),

    #[error("Aggregate inconsistency: {0}")]
    AggregateInconsistency(#[from] AggregateInconsistency),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Invalid stored value: {0}")]
    Corrupt(#[from] ParseStatusError),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether re-running the whole transaction right away may succeed
    pub fn is_transaction_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::AggregateInconsistency(_) | StoreError::Conflict(_)
        )
    }

    /// Infrastructure trouble that a later redelivery may get past
    pub fn is_transient(&self) -> bool {
        self.is_transaction_retryable() || matches!(self, StoreError::Database(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::JobNotFound(_) | StoreError::FileNotFound { .. } | StoreError::ReportNotFound(_)
        )
    }
}

/// Outcome of recording one successful detection
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// The stored result; the earlier one when this was a redelivery
    pub result: ResultRecord,
    /// The job aggregate after recompute
    pub job: Job,
    /// A result for this file already existed
    pub duplicate: bool,
}

/// Outcome of recording one failed detection
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub file: FileRecord,
    pub job: Job,
    /// The file had already completed, so the failure was not applied
    pub ignored: bool,
}

/// Results in a report scope, plus the files that never produced one
#[derive(Debug, Clone, Default)]
pub struct ScopeSnapshot {
    pub results: Vec<ResultRecord>,
    pub failed_files: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job and its PENDING files
    async fn create_job(
        &self,
        owner_id: &str,
        files: Vec<NewFile>,
    ) -> Result<(Job, Vec<FileRecord>), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Most recent jobs first
    async fn list_jobs(&self, owner_id: Option<String>, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<FileRecord>, StoreError>;

    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<ResultRecord>, StoreError>;

    /// Move a PENDING file to PROCESSING; settled files are left alone
    async fn mark_file_processing(&self, job_id: Uuid, file_id: Uuid) -> Result<FileRecord, StoreError>;

    /// Complete the file, insert its result once, and recompute the job
    async fn record_completion(&self, result: NewResult) -> Result<CompletionOutcome, StoreError>;

    /// Fail the file unless it already completed, and recompute the job
    async fn record_failure(
        &self,
        job_id: Uuid,
        file_id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, StoreError>;

    async fn scope_snapshot(&self, scope: &ReportScopeRef) -> Result<ScopeSnapshot, StoreError>;

    /// Insert a PENDING report unless one with the same id exists
    async fn create_report_if_absent(&self, request: &ReportRequest) -> Result<Report, StoreError>;

    /// Start a generation attempt: creates the report if needed and bumps
    /// its attempt count. A COMPLETED report is returned untouched.
    async fn begin_report_attempt(&self, request: &ReportRequest) -> Result<Report, StoreError>;

    async fn mark_report_completed(
        &self,
        report_id: Uuid,
        summary: serde_json::Value,
        artifact_key: &str,
    ) -> Result<Report, StoreError>;

    /// Record a failed attempt; COMPLETED reports are never changed
    async fn mark_report_failed(&self, report_id: Uuid, error: &str) -> Result<Report, StoreError>;

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError>;

    async fn pipeline_counters(&self) -> Result<PipelineCounters, StoreError>;

    /// Store reachability
    async fn ping(&self) -> Result<(), StoreError>;
}
