//! Implementation of the `produce` subcommand: drive the looping task
//! producer, once or on an interval.

use crate::registry;
use clock::SystemProvider;
use observability_deps::tracing::info;
use producer::{LoopingTaskProducer, ProducerConfig, Selection};
use state_store::{FileStateStore, StateStore};
use std::{path::PathBuf, sync::Arc, time::Duration};
use storage::StorageResolver;
use task_queue::{file::FileTaskQueue, TaskQueue};
use thiserror::Error;

/// How long a taken task stays invisible in the directory-backed queue.
const QUEUE_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("Reading selection list {path}: {source}")]
    SelectionList {
        path: String,
        source: std::io::Error,
    },

    #[error("Opening task queue: {0}")]
    Queue(#[from] task_queue::TaskQueueError),

    #[error("Producer run: {0}")]
    Producer(#[from] producer::Error),
}

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// File the producer checkpoints unfinished morsels to.
    #[clap(long = "--state-file", env = "DUPMILL_STATE_FILE", action)]
    state_file: PathBuf,

    /// Soft ceiling on outstanding tasks in the queue.
    #[clap(
        long = "--max-task-queue-size",
        env = "DUPMILL_MAX_TASK_QUEUE_SIZE",
        default_value = "1000",
        action
    )]
    max_task_queue_size: usize,

    /// Rerun interval (e.g. "5m"). A single pass is made when unset.
    #[clap(long = "--frequency", env = "DUPMILL_FREQUENCY", action)]
    frequency: Option<humantime::Duration>,

    /// Name of the task queue to fill.
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

    /// Replication policy snapshot file.
    #[clap(long = "--policy-file", env = "DUPMILL_POLICY_FILE", action)]
    policy_file: PathBuf,

    /// Line-delimited `account[/spaceId]` whitelist.
    #[clap(long = "--inclusion-list", env = "DUPMILL_INCLUSION_LIST", action)]
    inclusion_list: Option<PathBuf>,

    /// Line-delimited `account[/spaceId]` blacklist; wins over inclusions.
    #[clap(long = "--exclusion-list", env = "DUPMILL_EXCLUSION_LIST", action)]
    exclusion_list: Option<PathBuf>,
}

async fn read_list(path: &Option<PathBuf>) -> Result<Option<String>, Error> {
    match path {
        None => Ok(None),
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map(Some)
            .map_err(|source| Error::SelectionList {
                path: path.display().to_string(),
                source,
            }),
    }
}

pub async fn command(config: Config) -> Result<(), Error> {
    let resolver = registry::resolver_from_credentials(&config.credentials_file).await?;
    let policies = registry::load_policies(&config.policy_file).await?;

    let inclusions = read_list(&config.inclusion_list).await?;
    let exclusions = read_list(&config.exclusion_list).await?;
    let selection = Selection::from_lists(inclusions.as_deref(), exclusions.as_deref());

    let queue = Arc::new(
        FileTaskQueue::new(
            config.queue_dir.join(&config.task_queue_name),
            QUEUE_VISIBILITY_TIMEOUT,
            Arc::new(SystemProvider::new()),
        )
        .await?,
    );
    let state = Arc::new(FileStateStore::new(&config.state_file));

    let producer = LoopingTaskProducer::new(
        state as Arc<dyn StateStore>,
        queue as Arc<dyn TaskQueue>,
        resolver as Arc<dyn StorageResolver>,
        selection,
        ProducerConfig {
            max_task_queue_size: config.max_task_queue_size,
            ..ProducerConfig::default()
        },
    );

    let shutdown = crate::shutdown_token();
    info!(queue = config.task_queue_name, "starting producer");

    match config.frequency {
        None => {
            producer.run(&policies, shutdown).await?;
        }
        Some(frequency) => loop {
            let summary = producer.run(&policies, shutdown.clone()).await?;
            info!(
                tasks_enqueued = summary.tasks_enqueued,
                morsels_remaining = summary.morsels_remaining,
                "producer pass complete"
            );
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(frequency.into()) => {}
                _ = shutdown.cancelled() => break,
            }
        },
    }
    Ok(())
}
