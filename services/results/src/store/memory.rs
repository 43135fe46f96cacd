//! In-process [`JobStore`].
//!
//! Every operation runs under one lock, which gives the same all-or-nothing
//! visibility as a Postgres transaction holding the job row lock. Failures
//! can be injected to exercise retry and outage handling.

use super::{CompletionOutcome, FailureOutcome, JobStore, ScopeSnapshot, StoreError};
use crate::models::{
    FileRecord, FileStatus, Job, NewFile, NewResult, PipelineCounters, Report, ReportStatus,
    ResultRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use ndt_pipeline::{ReportRequest, ReportScopeRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    files: HashMap<Uuid, FileRecord>,
    // keyed by (job_id, file_id)
    results: HashMap<(Uuid, Uuid), ResultRecord>,
    reports: HashMap<Uuid, Report>,
}

impl State {
    fn file_in_job(&self, job_id: Uuid, file_id: Uuid) -> Result<&FileRecord, StoreError> {
        self.files
            .get(&file_id)
            .filter(|file| file.job_id == job_id)
            .ok_or(StoreError::FileNotFound { job_id, file_id })
    }

    fn recompute(&self, job: &mut Job) -> Result<(), StoreError> {
        let (processed, failed) = self
            .files
            .values()
            .filter(|file| file.job_id == job.id)
            .fold((0, 0), |(processed, failed), file| match file.status {
                FileStatus::Completed => (processed + 1, failed),
                FileStatus::Failed => (processed, failed + 1),
                _ => (processed, failed),
            });
        job.apply_counts(processed, failed, Utc::now())?;
        Ok(())
    }

    fn jobs_in_scope(&self, scope: &ReportScopeRef) -> Vec<Uuid> {
        match scope {
            ReportScopeRef::Job(job_id) => vec![*job_id],
            ReportScopeRef::Owner(owner_id) => self
                .jobs
                .values()
                .filter(|job| &job.owner_id == owner_id)
                .map(|job| job.id)
                .collect(),
        }
    }

    fn report(&self, report_id: Uuid) -> Result<Report, StoreError> {
        self.reports
            .get(&report_id)
            .cloned()
            .ok_or(StoreError::ReportNotFound(report_id))
    }
}

/// In-memory [`JobStore`]
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
    offline: AtomicBool,
    injected_conflicts: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` recordings abort with a serialization conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Every report row, in no particular order
    pub fn reports(&self) -> Vec<Report> {
        self.state.lock().reports.values().cloned().collect()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Database("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_injected_conflict(&self) -> Result<(), StoreError> {
        let taken = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Conflict(
                "could not serialize access due to concurrent update".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        owner_id: &str,
        files: Vec<NewFile>,
    ) -> Result<(Job, Vec<FileRecord>), StoreError> {
        self.ensure_online()?;
        let total = i32::try_from(files.len())
            .map_err(|_| StoreError::Database("too many files in one job".to_string()))?;
        let now = Utc::now();
        let job = Job::new(owner_id, total, now);

        let records: Vec<FileRecord> = files
            .into_iter()
            .map(|file| FileRecord {
                id: Uuid::new_v4(),
                job_id: job.id,
                name: file.name,
                storage_key: file.storage_key,
                status: FileStatus::Pending,
                processed_at: None,
                created_at: now,
            })
            .collect();

        let mut state = self.state.lock();
        state.jobs.insert(job.id, job.clone());
        for record in &records {
            state.files.insert(record.id, record.clone());
        }
        Ok((job, records))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.ensure_online()?;
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, owner_id: Option<String>, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.ensure_online()?;
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| owner_id.as_ref().map_or(true, |owner| &job.owner_id == owner))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<FileRecord>, StoreError> {
        self.ensure_online()?;
        let state = self.state.lock();
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|file| file.job_id == job_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<ResultRecord>, StoreError> {
        self.ensure_online()?;
        let state = self.state.lock();
        let mut results: Vec<ResultRecord> = state
            .results
            .values()
            .filter(|result| result.job_id == job_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    async fn mark_file_processing(&self, job_id: Uuid, file_id: Uuid) -> Result<FileRecord, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        state.file_in_job(job_id, file_id)?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(StoreError::FileNotFound { job_id, file_id })?;
        if file.status == FileStatus::Pending {
            file.status = FileStatus::Processing;
        }
        Ok(file.clone())
    }

    async fn record_completion(&self, result: NewResult) -> Result<CompletionOutcome, StoreError> {
        self.ensure_online()?;
        self.take_injected_conflict()?;

        let mut state = self.state.lock();
        let mut job = state
            .jobs
            .get(&result.job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(result.job_id))?;
        let mut file = state.file_in_job(result.job_id, result.file_id)?.clone();

        // Work on copies and write back only once everything succeeded
        let now = Utc::now();
        if file.status != FileStatus::Completed {
            file.status = FileStatus::Completed;
            file.processed_at = Some(now);
        }

        let key = (result.job_id, result.file_id);
        let (record, duplicate) = match state.results.get(&key) {
            Some(existing) => (existing.clone(), true),
            None => (result.into_record(Uuid::new_v4(), now), false),
        };

        let previous = state.files.insert(file.id, file.clone());
        if let Err(e) = state.recompute(&mut job) {
            if let Some(previous) = previous {
                state.files.insert(previous.id, previous);
            }
            return Err(e);
        }

        state.results.insert(key, record.clone());
        state.jobs.insert(job.id, job.clone());

        Ok(CompletionOutcome {
            result: record,
            job,
            duplicate,
        })
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        file_id: Uuid,
        _error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        self.ensure_online()?;

        let mut state = self.state.lock();
        let mut job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?;
        let mut file = state.file_in_job(job_id, file_id)?.clone();

        if !file.status.can_transition_to(FileStatus::Failed) {
            return Ok(FailureOutcome {
                file,
                job,
                ignored: true,
            });
        }

        file.status = FileStatus::Failed;
        file.processed_at = Some(Utc::now());
        let previous = state.files.insert(file.id, file.clone());
        if let Err(e) = state.recompute(&mut job) {
            if let Some(previous) = previous {
                state.files.insert(previous.id, previous);
            }
            return Err(e);
        }
        state.jobs.insert(job.id, job.clone());

        Ok(FailureOutcome {
            file,
            job,
            ignored: false,
        })
    }

    async fn scope_snapshot(&self, scope: &ReportScopeRef) -> Result<ScopeSnapshot, StoreError> {
        self.ensure_online()?;
        let state = self.state.lock();
        let job_ids = state.jobs_in_scope(scope);

        let mut results: Vec<ResultRecord> = state
            .results
            .values()
            .filter(|result| job_ids.contains(&result.job_id))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let failed_files = state
            .files
            .values()
            .filter(|file| job_ids.contains(&file.job_id) && file.status == FileStatus::Failed)
            .count() as i64;

        Ok(ScopeSnapshot {
            results,
            failed_files,
        })
    }

    async fn create_report_if_absent(&self, request: &ReportRequest) -> Result<Report, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        let report = state
            .reports
            .entry(request.report_id)
            .or_insert_with(|| {
                Report::pending(request.report_id, request.scope.clone(), request.format, Utc::now())
            });
        Ok(report.clone())
    }

    async fn begin_report_attempt(&self, request: &ReportRequest) -> Result<Report, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        let report = state
            .reports
            .entry(request.report_id)
            .or_insert_with(|| {
                Report::pending(request.report_id, request.scope.clone(), request.format, Utc::now())
            });
        if report.status != ReportStatus::Completed {
            report.status = ReportStatus::Pending;
            report.attempts += 1;
        }
        Ok(report.clone())
    }

    async fn mark_report_completed(
        &self,
        report_id: Uuid,
        summary: serde_json::Value,
        artifact_key: &str,
    ) -> Result<Report, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        if let Some(report) = state.reports.get_mut(&report_id) {
            if report.status != ReportStatus::Completed {
                report.status = ReportStatus::Completed;
                report.summary = Some(summary);
                report.artifact_key = Some(artifact_key.to_string());
                report.error = None;
                report.generated_at = Some(Utc::now());
            }
        }
        state.report(report_id)
    }

    async fn mark_report_failed(&self, report_id: Uuid, error: &str) -> Result<Report, StoreError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        if let Some(report) = state.reports.get_mut(&report_id) {
            if report.status != ReportStatus::Completed {
                report.status = ReportStatus::Failed;
                report.error = Some(error.to_string());
            }
        }
        state.report(report_id)
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        self.ensure_online()?;
        Ok(self.state.lock().reports.get(&report_id).cloned())
    }

    async fn pipeline_counters(&self) -> Result<PipelineCounters, StoreError> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(PipelineCounters {
            total_jobs: state.jobs.len() as i64,
            active_jobs: state.jobs.values().filter(|job| !job.status.is_terminal()).count() as i64,
            total_results: state.results.len() as i64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_online()
    }
}
