//! Live job progress for SSE subscribers.

use crate::models::{Job, JobStatus};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

/// Job aggregate after one file settled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: Uuid,
    /// The file whose outcome triggered the event; absent for snapshots
    pub file_id: Option<Uuid>,
    pub processed_files: i32,
    pub failed_files: i32,
    pub total_files: i32,
    pub progress: f64,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    pub fn from_job(job: &Job, file_id: Option<Uuid>) -> Self {
        Self {
            job_id: job.id,
            file_id,
            processed_files: job.processed_files,
            failed_files: job.failed_files,
            total_files: job.total_files,
            progress: job.progress,
            status: job.status,
            timestamp: job.updated_at,
        }
    }
}

/// Fan-out of progress events to every connected client
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: broadcast::Sender<JobProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver to whoever is listening; events nobody listens to are dropped
    pub fn publish(&self, event: JobProgressEvent) {
        if let Ok(receivers) = self.sender.send(event) {
            debug!(receivers, "Progress event broadcast");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Events for one job. A subscriber that falls behind skips the events
    /// it missed; the next one carries the full aggregate anyway.
    pub fn subscribe_job(&self, job_id: Uuid) -> impl Stream<Item = JobProgressEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |event| async move {
            match event {
                Ok(event) if event.job_id == job_id => Some(event),
                _ => None,
            }
        })
    }

    /// Live client connections
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
