//! Background queue consumers.
//!
//! A consumer that stops on its own leaves its queue unread while the rest of
//! the process looks healthy. Any such exit cancels the shared shutdown token
//! so the whole process stops and the orchestrator restarts it.

use anyhow::{Context, Result};
use ndt_pipeline::{MessageBroker, MessageHandler};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run `handler` on `queue` until `shutdown` is cancelled
pub fn spawn_consumer(
    tasks: &mut JoinSet<Result<()>>,
    broker: Arc<dyn MessageBroker>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) {
    tasks.spawn(async move {
        info!(queue = %queue, "Starting consumer");
        let result = broker.consume(&queue, handler, shutdown.clone()).await;

        match result {
            Ok(()) if shutdown.is_cancelled() => {
                info!(queue = %queue, "Consumer stopped");
                Ok(())
            }
            Ok(()) => {
                error!(queue = %queue, "Consumer exited before shutdown, stopping service");
                metrics::counter!("results.consumer.failures", "queue" => queue.clone()).increment(1);
                shutdown.cancel();
                anyhow::bail!("consumer for {} exited before shutdown", queue)
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer failed, stopping service");
                metrics::counter!("results.consumer.failures", "queue" => queue.clone()).increment(1);
                shutdown.cancel();
                Err(e).with_context(|| format!("consumer for {} failed", queue))
            }
        }
    });
}
