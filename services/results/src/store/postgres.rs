use super::{CompletionOutcome, FailureOutcome, JobStore, ScopeSnapshot, StoreError};
use crate::config::DatabaseConfig;
use crate::models::{
    format_as_str, format_from_str, scope_columns, scope_from_columns, FileRecord, FileStatus,
    Job, NewFile, NewResult, PipelineCounters, Report, ResultRecord,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndt_pipeline::{DetectionItem, ReportRequest, ReportScopeRef};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // serialization_failure, deadlock_detected
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Database(e.to_string())
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: String,
    total_files: i32,
    processed_files: i32,
    failed_files: i32,
    progress: f64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            owner_id: row.owner_id,
            total_files: row.total_files,
            processed_files: row.processed_files,
            failed_files: row.failed_files,
            progress: row.progress,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    job_id: Uuid,
    name: String,
    storage_key: Option<String>,
    status: String,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(FileRecord {
            id: row.id,
            job_id: row.job_id,
            name: row.name,
            storage_key: row.storage_key,
            status: row.status.parse()?,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    id: Uuid,
    job_id: Uuid,
    file_id: Uuid,
    verdict: String,
    defect_count: i32,
    confidence: f64,
    detections: Json<Vec<DetectionItem>>,
    processing_time_ms: f64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for ResultRecord {
    type Error = StoreError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        Ok(ResultRecord {
            id: row.id,
            job_id: row.job_id,
            file_id: row.file_id,
            verdict: row.verdict.parse()?,
            defect_count: row.defect_count,
            confidence: row.confidence,
            detections: row.detections.0,
            processing_time_ms: row.processing_time_ms,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReportRow {
    id: Uuid,
    scope_kind: String,
    scope_id: String,
    format: String,
    status: String,
    summary: Option<serde_json::Value>,
    artifact_key: Option<String>,
    error: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    generated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReportRow> for Report {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(Report {
            id: row.id,
            scope: scope_from_columns(&row.scope_kind, &row.scope_id)?,
            format: format_from_str(&row.format)?,
            status: row.status.parse()?,
            summary: row.summary,
            artifact_key: row.artifact_key,
            error: row.error,
            attempts: row.attempts,
            created_at: row.created_at,
            generated_at: row.generated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// PostgreSQL-backed [`JobStore`]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store with its own connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, total_files, processed_files, failed_files,
                   progress, status, created_at, updated_at, started_at, completed_at
            FROM jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        Job::try_from(row)
    }

    /// Count the job's settled files and write the aggregate, inside the
    /// transaction that holds the job row lock
    async fn recompute_job(tx: &mut Transaction<'_, Postgres>, job: &mut Job) -> Result<(), StoreError> {
        let (processed, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'COMPLETED'),
                COUNT(*) FILTER (WHERE status = 'FAILED')
            FROM files
            WHERE job_id = $1
            "#,
        )
        .bind(job.id)
        .fetch_one(&mut **tx)
        .await?;

        let processed = i32::try_from(processed).unwrap_or(i32::MAX);
        let failed = i32::try_from(failed).unwrap_or(i32::MAX);
        job.apply_counts(processed, failed, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET processed_files = $2,
                failed_files = $3,
                progress = $4,
                status = $5,
                updated_at = $6,
                started_at = $7,
                completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.processed_files)
        .bind(job.failed_files)
        .bind(job.progress)
        .bind(job.status.as_str())
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn fetch_file(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        file_id: Uuid,
    ) -> Result<FileRecord, StoreError> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, job_id, name, storage_key, status, processed_at, created_at
            FROM files
            WHERE id = $1 AND job_id = $2
            FOR UPDATE
            "#,
        )
        .bind(file_id)
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::FileNotFound { job_id, file_id })?;

        FileRecord::try_from(row)
    }

    async fn fetch_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, scope_kind, scope_id, format, status, summary,
                   artifact_key, error, attempts, created_at, generated_at
            FROM reports
            WHERE id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Report::try_from).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, files), fields(file_count = files.len()))]
    async fn create_job(
        &self,
        owner_id: &str,
        files: Vec<NewFile>,
    ) -> Result<(Job, Vec<FileRecord>), StoreError> {
        let total = i32::try_from(files.len())
            .map_err(|_| StoreError::Database("too many files in one job".to_string()))?;
        let job = Job::new(owner_id, total, Utc::now());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner_id, total_files, processed_files, failed_files,
                progress, status, created_at, updated_at, completed_at
            ) VALUES ($1, $2, $3, 0, 0, 0, $4, $5, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(&job.owner_id)
        .bind(job.total_files)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await?;

        let mut records = Vec::with_capacity(files.len());
        for file in files {
            let row = sqlx::query_as::<_, FileRow>(
                r#"
                INSERT INTO files (id, job_id, name, storage_key, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'PENDING', $5, $5)
                RETURNING id, job_id, name, storage_key, status, processed_at, created_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.id)
            .bind(&file.name)
            .bind(&file.storage_key)
            .bind(job.created_at)
            .fetch_one(&mut *tx)
            .await?;
            records.push(FileRecord::try_from(row)?);
        }

        tx.commit().await?;

        debug!(job_id = %job.id, total_files = total, "Job created");
        Ok((job, records))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, total_files, processed_files, failed_files,
                   progress, status, created_at, updated_at, started_at, completed_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, owner_id: Option<String>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, total_files, processed_files, failed_files,
                   progress, status, created_at, updated_at, started_at, completed_at
            FROM jobs
            WHERE ($1::text IS NULL OR owner_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn get_job_files(&self, job_id: Uuid) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, job_id, name, storage_key, status, processed_at, created_at
            FROM files
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn get_job_results(&self, job_id: Uuid) -> Result<Vec<ResultRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT id, job_id, file_id, verdict, defect_count, confidence,
                   detections, processing_time_ms, created_at
            FROM results
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn mark_file_processing(&self, job_id: Uuid, file_id: Uuid) -> Result<FileRecord, StoreError> {
        let updated = sqlx::query_as::<_, FileRow>(
            r#"
            UPDATE files
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1 AND job_id = $2 AND status = 'PENDING'
            RETURNING id, job_id, name, storage_key, status, processed_at, created_at
            "#,
        )
        .bind(file_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return FileRecord::try_from(row);
        }

        // Already past PENDING (or unknown); report it as it is
        let mut tx = self.pool.begin().await?;
        let file = Self::fetch_file(&mut tx, job_id, file_id).await?;
        tx.commit().await?;
        Ok(file)
    }

    #[instrument(skip(self, result), fields(job_id = %result.job_id, file_id = %result.file_id))]
    async fn record_completion(&self, result: NewResult) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, result.job_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE files
            SET status = 'COMPLETED',
                error = NULL,
                processed_at = CASE WHEN status = 'COMPLETED' THEN processed_at ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1 AND job_id = $2
            "#,
        )
        .bind(result.file_id)
        .bind(result.job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::FileNotFound {
                job_id: result.job_id,
                file_id: result.file_id,
            });
        }

        let inserted = sqlx::query_as::<_, ResultRow>(
            r#"
            INSERT INTO results (
                id, job_id, file_id, verdict, defect_count, confidence,
                detections, processing_time_ms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (job_id, file_id) DO NOTHING
            RETURNING id, job_id, file_id, verdict, defect_count, confidence,
                      detections, processing_time_ms, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(result.job_id)
        .bind(result.file_id)
        .bind(result.verdict.as_str())
        .bind(result.defect_count)
        .bind(result.confidence)
        .bind(Json(&result.detections))
        .bind(result.processing_time_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let (row, duplicate) = match inserted {
            Some(row) => (row, false),
            None => {
                let existing = sqlx::query_as::<_, ResultRow>(
                    r#"
                    SELECT id, job_id, file_id, verdict, defect_count, confidence,
                           detections, processing_time_ms, created_at
                    FROM results
                    WHERE job_id = $1 AND file_id = $2
                    "#,
                )
                .bind(result.job_id)
                .bind(result.file_id)
                .fetch_one(&mut *tx)
                .await?;
                (existing, true)
            }
        };

        Self::recompute_job(&mut tx, &mut job).await?;
        tx.commit().await?;

        Ok(CompletionOutcome {
            result: ResultRecord::try_from(row)?,
            job,
            duplicate,
        })
    }

    #[instrument(skip(self, error))]
    async fn record_failure(
        &self,
        job_id: Uuid,
        file_id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let file = Self::fetch_file(&mut tx, job_id, file_id).await?;

        if !file.status.can_transition_to(FileStatus::Failed) {
            tx.commit().await?;
            return Ok(FailureOutcome {
                file,
                job,
                ignored: true,
            });
        }

        let row = sqlx::query_as::<_, FileRow>(
            r#"
            UPDATE files
            SET status = 'FAILED', error = $3, processed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND job_id = $2
            RETURNING id, job_id, name, storage_key, status, processed_at, created_at
            "#,
        )
        .bind(file_id)
        .bind(job_id)
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        Self::recompute_job(&mut tx, &mut job).await?;
        tx.commit().await?;

        Ok(FailureOutcome {
            file: FileRecord::try_from(row)?,
            job,
            ignored: false,
        })
    }

    async fn scope_snapshot(&self, scope: &ReportScopeRef) -> Result<ScopeSnapshot, StoreError> {
        let (rows, failed_files): (Vec<ResultRow>, (i64,)) = match scope {
            ReportScopeRef::Job(job_id) => {
                let rows = sqlx::query_as::<_, ResultRow>(
                    r#"
                    SELECT id, job_id, file_id, verdict, defect_count, confidence,
                           detections, processing_time_ms, created_at
                    FROM results
                    WHERE job_id = $1
                    ORDER BY created_at, id
                    "#,
                )
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
                let failed = sqlx::query_as(
                    "SELECT COUNT(*) FROM files WHERE job_id = $1 AND status = 'FAILED'",
                )
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
                (rows, failed)
            }
            ReportScopeRef::Owner(owner_id) => {
                let rows = sqlx::query_as::<_, ResultRow>(
                    r#"
                    SELECT r.id, r.job_id, r.file_id, r.verdict, r.defect_count, r.confidence,
                           r.detections, r.processing_time_ms, r.created_at
                    FROM results r
                    JOIN jobs j ON j.id = r.job_id
                    WHERE j.owner_id = $1
                    ORDER BY r.created_at, r.id
                    "#,
                )
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
                let failed = sqlx::query_as(
                    r#"
                    SELECT COUNT(*)
                    FROM files f
                    JOIN jobs j ON j.id = f.job_id
                    WHERE j.owner_id = $1 AND f.status = 'FAILED'
                    "#,
                )
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;
                (rows, failed)
            }
        };

        Ok(ScopeSnapshot {
            results: convert_all(rows)?,
            failed_files: failed_files.0,
        })
    }

    async fn create_report_if_absent(&self, request: &ReportRequest) -> Result<Report, StoreError> {
        let (kind, scope_id) = scope_columns(&request.scope);
        sqlx::query(
            r#"
            INSERT INTO reports (id, scope_kind, scope_id, format, status, attempts)
            VALUES ($1, $2, $3, $4, 'PENDING', 0)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.report_id)
        .bind(kind)
        .bind(&scope_id)
        .bind(format_as_str(request.format))
        .execute(&self.pool)
        .await?;

        self.fetch_report(request.report_id)
            .await?
            .ok_or(StoreError::ReportNotFound(request.report_id))
    }

    #[instrument(skip(self, request), fields(report_id = %request.report_id))]
    async fn begin_report_attempt(&self, request: &ReportRequest) -> Result<Report, StoreError> {
        let (kind, scope_id) = scope_columns(&request.scope);
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            INSERT INTO reports (id, scope_kind, scope_id, format, status, attempts)
            VALUES ($1, $2, $3, $4, 'PENDING', 1)
            ON CONFLICT (id) DO UPDATE
                SET attempts = reports.attempts + 1,
                    status = 'PENDING',
                    updated_at = NOW()
                WHERE reports.status <> 'COMPLETED'
            RETURNING id, scope_kind, scope_id, format, status, summary,
                      artifact_key, error, attempts, created_at, generated_at
            "#,
        )
        .bind(request.report_id)
        .bind(kind)
        .bind(&scope_id)
        .bind(format_as_str(request.format))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Report::try_from(row),
            None => self
                .fetch_report(request.report_id)
                .await?
                .ok_or(StoreError::ReportNotFound(request.report_id)),
        }
    }

    async fn mark_report_completed(
        &self,
        report_id: Uuid,
        summary: serde_json::Value,
        artifact_key: &str,
    ) -> Result<Report, StoreError> {
        sqlx::query(
            r#"
            UPDATE reports
            SET status = 'COMPLETED', summary = $2, artifact_key = $3, error = NULL,
                generated_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(report_id)
        .bind(&summary)
        .bind(artifact_key)
        .execute(&self.pool)
        .await?;

        self.fetch_report(report_id)
            .await?
            .ok_or(StoreError::ReportNotFound(report_id))
    }

    async fn mark_report_failed(&self, report_id: Uuid, error: &str) -> Result<Report, StoreError> {
        sqlx::query(
            r#"
            UPDATE reports
            SET status = 'FAILED', error = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(report_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.fetch_report(report_id)
            .await?
            .ok_or(StoreError::ReportNotFound(report_id))
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        self.fetch_report(report_id).await
    }

    async fn pipeline_counters(&self) -> Result<PipelineCounters, StoreError> {
        let (total_jobs, active_jobs, total_results): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM jobs),
                (SELECT COUNT(*) FROM jobs WHERE status IN ('QUEUED', 'PROCESSING')),
                (SELECT COUNT(*) FROM results)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PipelineCounters {
            total_jobs,
            active_jobs,
            total_results,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
