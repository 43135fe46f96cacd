//! Composite health of the results service and its dependencies.
//!
//! Every dependency is probed concurrently under its own timeout. A failing
//! or slow dependency only marks its own entry; the snapshot itself is
//! always produced.

use crate::models::PipelineCounters;
use crate::progress::ProgressBroadcaster;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use ndt_pipeline::{MessageBroker, ModelInventory, ObjectStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// State of one dependency
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub status: HealthStatus,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Check-specific reading: queue depth, model count, connection count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_mb: u64,
    pub virtual_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: f64,
    pub response_time_ms: f64,
    pub services: BTreeMap<String, DependencyHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<PipelineCounters>,
}

impl HealthSnapshot {
    pub fn service(&self, name: &str) -> Option<&DependencyHealth> {
        self.services.get(name)
    }
}

/// Healthy only when every entry is
pub fn composite_status<'a>(entries: impl IntoIterator<Item = &'a DependencyHealth>) -> HealthStatus {
    if entries
        .into_iter()
        .all(|entry| entry.status == HealthStatus::Healthy)
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

pub struct HealthAggregator {
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    broker: Arc<dyn MessageBroker>,
    models: Arc<dyn ModelInventory>,
    progress: ProgressBroadcaster,
    queues: Vec<String>,
    timeout: Duration,
    queue_depth_warning: u64,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        broker: Arc<dyn MessageBroker>,
        models: Arc<dyn ModelInventory>,
        progress: ProgressBroadcaster,
        queues: Vec<String>,
    ) -> Self {
        Self {
            store,
            objects,
            broker,
            models,
            progress,
            queues,
            timeout: Duration::from_secs(2),
            queue_depth_warning: 1000,
            started_at: Instant::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue_depth_warning(mut self, depth: u64) -> Self {
        self.queue_depth_warning = depth;
        self
    }

    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> HealthSnapshot {
        let started = Instant::now();

        let (database, object_store, broker, queue, models, counters) = tokio::join!(
            self.probe("database", async { self.store.ping().await }),
            self.probe("objectStore", async { self.objects.ping().await }),
            self.probe("broker", async { self.broker.ping().await }),
            self.probe("queue", self.total_queue_depth()),
            self.probe("models", async {
                self.models.loaded_models().await.map(|models| models.len() as u64)
            }),
            tokio::time::timeout(self.timeout, self.store.pipeline_counters()),
        );

        let queue = self.degrade_if(queue, |depth| depth > self.queue_depth_warning);
        let models = self.degrade_if(models, |count| count == 0);

        let mut services = BTreeMap::new();
        services.insert("database".to_string(), unit(database));
        services.insert("objectStore".to_string(), unit(object_store));
        services.insert("broker".to_string(), unit(broker));
        services.insert("queue".to_string(), queue);
        services.insert("models".to_string(), models);
        services.insert(
            "connections".to_string(),
            DependencyHealth {
                status: HealthStatus::Healthy,
                latency_ms: 0.0,
                error: None,
                value: Some(self.progress.subscriber_count() as u64),
            },
        );

        let status = composite_status(services.values());
        if status != HealthStatus::Healthy {
            let failing: Vec<&str> = services
                .iter()
                .filter(|(_, entry)| entry.status != HealthStatus::Healthy)
                .map(|(name, _)| name.as_str())
                .collect();
            warn!(?failing, "Service degraded");
        }

        HealthSnapshot {
            status,
            timestamp: Utc::now(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            response_time_ms: millis(started.elapsed()),
            services,
            memory: read_memory_usage(),
            counters: counters.ok().and_then(Result::ok),
        }
    }

    async fn total_queue_depth(&self) -> Result<u64, ndt_pipeline::BrokerError> {
        let mut total = 0;
        for queue in &self.queues {
            total += self.broker.queue_depth(queue).await?;
        }
        Ok(total)
    }

    /// Run one check under the shared timeout, measuring its latency
    async fn probe<T, E, F>(&self, name: &str, check: F) -> Probe<T>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", self.timeout.as_millis())),
        };
        if let Err(e) = &outcome {
            warn!(dependency = name, error = %e, "Health check failed");
        }
        Probe {
            outcome,
            latency_ms: millis(started.elapsed()),
        }
    }

    fn degrade_if(&self, probe: Probe<u64>, degraded: impl Fn(u64) -> bool) -> DependencyHealth {
        match probe.outcome {
            Ok(value) => DependencyHealth {
                status: if degraded(value) {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                latency_ms: probe.latency_ms,
                error: None,
                value: Some(value),
            },
            Err(error) => unhealthy(error, probe.latency_ms),
        }
    }
}

struct Probe<T> {
    outcome: Result<T, String>,
    latency_ms: f64,
}

fn unit(probe: Probe<()>) -> DependencyHealth {
    match probe.outcome {
        Ok(()) => DependencyHealth {
            status: HealthStatus::Healthy,
            latency_ms: probe.latency_ms,
            error: None,
            value: None,
        },
        Err(error) => unhealthy(error, probe.latency_ms),
    }
}

fn unhealthy(error: String, latency_ms: f64) -> DependencyHealth {
    DependencyHealth {
        status: HealthStatus::Unhealthy,
        latency_ms,
        error: Some(error),
        value: None,
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Resident and virtual size from `/proc/self/status`; `None` off Linux
fn read_memory_usage() -> Option<MemoryUsage> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_proc_status(&status)
}

/// `VmRSS` and `VmSize` are reported in kB whatever the page size
fn parse_proc_status(status: &str) -> Option<MemoryUsage> {
    let kb = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
    };
    Some(MemoryUsage {
        rss_mb: kb("VmRSS")? / 1024,
        virtual_mb: kb("VmSize")? / 1024,
    })
}
