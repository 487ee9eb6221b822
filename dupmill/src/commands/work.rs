//! Implementation of the `work` subcommand: drain the duplication queue and
//! execute each task through the processor.
//!
//! Failed tasks are left in flight; the queue redelivers them after the
//! visibility timeout. What ultimately happens to tasks that keep failing
//! (dead-lettering) is the queue deployment's policy, not ours.

use crate::registry;
use backoff::BackoffConfig;
use clock::SystemProvider;
use observability_deps::tracing::{info, warn};
use processor::DuplicationTaskProcessor;
use std::{path::PathBuf, sync::Arc, time::Duration};
use storage::StorageResolver;
use task_queue::{file::FileTaskQueue, TaskQueue};
use thiserror::Error;

const QUEUE_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("Task queue: {0}")]
    Queue(#[from] task_queue::TaskQueueError),
}

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// Name of the task queue to drain.
    #[clap(
        long = "--task-queue-name",
        env = "DUPMILL_TASK_QUEUE_NAME",
        default_value = "duplication-tasks",
        action
    )]
    task_queue_name: String,

    /// Directory named task queues live under.
    #[clap(
        long = "--queue-dir",
        env = "DUPMILL_QUEUE_DIR",
        default_value = "queues",
        action
    )]
    queue_dir: PathBuf,

    /// Credentials file mapping (account, store) to provider specs.
    #[clap(long = "--credentials-file", env = "DUPMILL_CREDENTIALS_FILE", action)]
    credentials_file: PathBuf,

    /// How long to wait between polls of an empty queue.
    #[clap(
        long = "--idle-wait",
        env = "DUPMILL_IDLE_WAIT",
        default_value = "5s",
        action
    )]
    idle_wait: humantime::Duration,

    /// Exit once the queue is empty instead of waiting for more work.
    #[clap(long = "--drain-and-exit", env = "DUPMILL_DRAIN_AND_EXIT", action)]
    drain_and_exit: bool,
}

pub async fn command(config: Config) -> Result<(), Error> {
    let resolver = registry::resolver_from_credentials(&config.credentials_file).await?;

    let queue = Arc::new(
        FileTaskQueue::new(
            config.queue_dir.join(&config.task_queue_name),
            QUEUE_VISIBILITY_TIMEOUT,
            Arc::new(SystemProvider::new()),
        )
        .await?,
    );
    let processor = DuplicationTaskProcessor::new(
        resolver as Arc<dyn StorageResolver>,
        BackoffConfig::default(),
    );

    let shutdown = crate::shutdown_token();
    info!(queue = config.task_queue_name, "starting worker");

    loop {
        if shutdown.is_cancelled() {
            info!("shutdown requested, stopping worker");
            break;
        }

        let mut task = match queue.take().await {
            Ok(task) => task,
            Err(e) if e.is_timeout() => {
                if config.drain_and_exit {
                    info!("queue drained");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.idle_wait.into()) => continue,
                    _ = shutdown.cancelled() => continue,
                }
            }
            Err(e) => return Err(e.into()),
        };

        task.attempts += 1;

        // long copies should not get redelivered out from under us
        if let Err(e) = queue.extend_visibility(&task).await {
            warn!(task=%task, error=%e, "could not extend task visibility");
        }

        match processor.execute(&task).await {
            Ok(outcome) => {
                info!(task=%task, outcome=?outcome, attempts=task.attempts, "task complete");
                if let Err(e) = queue.delete(&task).await {
                    warn!(task=%task, error=%e, "completed task could not be deleted");
                }
            }
            Err(e) => {
                warn!(
                    task=%task,
                    error=%e,
                    attempts = task.attempts,
                    "task failed, leaving it for redelivery",
                );
            }
        }
    }
    Ok(())
}
