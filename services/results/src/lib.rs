//! NDT Results Service
//!
//! Turns per-file detection outcomes into durable results, keeps job-level
//! progress and pass/fail status current, and renders reports once jobs
//! settle. Detection outcomes arrive at least once; every handler here is
//! idempotent on the logical identity of what it records.
//!
//! ## Architecture
//!
//! ```text
//! file-processing queue        detection-results queue      report-generation queue
//! ┌──────────────┐             ┌──────────────┐             ┌──────────────┐
//! │ Detection    │────────────▶│ Result       │────────────▶│ Report       │
//! │ Worker       │             │ Recorder     │  job done   │ Generator    │
//! └──────────────┘             └──────────────┘             └──────────────┘
//!        │                        │      ▲  │                     │
//!        ▼                        ▼      │  ▼                     ▼
//! ┌──────────────┐        ┌──────────┐   │ ┌──────────┐    ┌──────────────┐
//! │ Object Store │        │ Postgres │   │ │ Progress │    │ Object Store │
//! │ + Detector   │        │ JobStore │   │ │ (SSE)    │    │ reports/     │
//! └──────────────┘        └──────────┘   │ └──────────┘    └──────────────┘
//!                                        │
//!                          POST /api/v1/detection/process
//! ```

pub mod api;
pub mod config;
pub mod consumers;
pub mod detection_worker;
pub mod health;
pub mod models;
pub mod progress;
pub mod recorder;
pub mod report;
pub mod store;

pub use config::Config;
pub use detection_worker::DetectionWorker;
pub use health::{DependencyHealth, HealthAggregator, HealthSnapshot, HealthStatus};
pub use models::{FileStatus, Job, JobStatus, ReportStatus, ResultRecord, Verdict};
pub use progress::{JobProgressEvent, ProgressBroadcaster};
pub use recorder::{DetectionResultHandler, RecordError, RecordOutcome, ResultRecorder};
pub use report::{ReportConsumer, ReportError, ReportGenerator, ReportRun, ReportSummary};
pub use store::{JobStore, MemoryJobStore, PostgresJobStore, StoreError};
