//! Directory-backed [`TaskQueue`] implementation.
//!
//! Envelopes live as JSON files under `visible/`; taking a task atomically
//! renames its file into `inflight/` with the visibility deadline encoded in
//! the file name, so redelivery survives process restarts. Single-node
//! durability only - the production mill runs against a hosted queue service
//! behind the same trait.

use crate::{
    codec::{read_task, write_task},
    TaskQueue, TaskQueueError,
};
use async_trait::async_trait;
use clock::{Time, TimeProvider};
use data_types::Task;
use observability_deps::tracing::debug;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

const VISIBLE_DIR: &str = "visible";
const INFLIGHT_DIR: &str = "inflight";

/// A [`TaskQueue`] persisted under a local directory.
#[derive(Debug)]
pub struct FileTaskQueue {
    root: PathBuf,
    visibility_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl FileTaskQueue {
    /// Open (or create) a queue rooted at `root`.
    pub async fn new(
        root: impl Into<PathBuf>,
        visibility_timeout: Duration,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, TaskQueueError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(VISIBLE_DIR)).await?;
        tokio::fs::create_dir_all(root.join(INFLIGHT_DIR)).await?;
        Ok(Self {
            root,
            visibility_timeout,
            time_provider,
        })
    }

    fn visible_dir(&self) -> PathBuf {
        self.root.join(VISIBLE_DIR)
    }

    fn inflight_dir(&self) -> PathBuf {
        self.root.join(INFLIGHT_DIR)
    }

    async fn dir_entries(&self, dir: &Path) -> Result<Vec<String>, TaskQueueError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Move lapsed in-flight files back into the visible directory.
    async fn redrive(&self, now: Time) -> Result<(), TaskQueueError> {
        for name in self.dir_entries(&self.inflight_dir()).await? {
            let (deadline, rest) = match name.split_once('-') {
                Some(parts) => parts,
                None => continue,
            };
            let deadline_ms = match deadline.parse::<i64>() {
                Ok(ms) => ms,
                Err(_) => continue,
            };
            if deadline_ms <= now.timestamp_millis() {
                debug!(file = rest, "visibility lapsed, redriving task");
                // a concurrent worker may have raced us; ignore rename misses
                let _ = tokio::fs::rename(
                    self.inflight_dir().join(&name),
                    self.visible_dir().join(rest),
                )
                .await;
            }
        }
        Ok(())
    }

    fn inflight_name(&self, deadline: Time, original: &str) -> String {
        format!("{:020}-{}", deadline.timestamp_millis(), original)
    }

    /// Locate the in-flight file holding a task with this identity.
    async fn find_inflight(&self, task: &Task) -> Result<Option<String>, TaskQueueError> {
        let identity = task.identity();
        for name in self.dir_entries(&self.inflight_dir()).await? {
            let payload = tokio::fs::read_to_string(self.inflight_dir().join(&name)).await?;
            if read_task(&payload)?.identity() == identity {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TaskQueue for FileTaskQueue {
    async fn put_batch(&self, tasks: &[Task]) -> Result<(), TaskQueueError> {
        let now = self.time_provider.now();
        for task in tasks {
            let payload = write_task(task)?;
            let name = format!("{:020}-{}.json", now.timestamp_millis(), uuid::Uuid::new_v4());
            tokio::fs::write(self.visible_dir().join(name), payload).await?;
        }
        Ok(())
    }

    async fn take(&self) -> Result<Task, TaskQueueError> {
        let now = self.time_provider.now();
        self.redrive(now).await?;

        let deadline = now + self.visibility_timeout;
        for name in self.dir_entries(&self.visible_dir()).await? {
            let claimed = self.inflight_dir().join(self.inflight_name(deadline, &name));
            // rename is the atomic claim; a racing worker loses and moves on
            match tokio::fs::rename(self.visible_dir().join(&name), &claimed).await {
                Ok(()) => {
                    let payload = tokio::fs::read_to_string(&claimed).await?;
                    return read_task(&payload);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TaskQueueError::timeout("queue is empty"))
    }

    async fn extend_visibility(&self, task: &Task) -> Result<(), TaskQueueError> {
        let name = self
            .find_inflight(task)
            .await?
            .ok_or_else(|| TaskQueueError::task_not_found(format!("task {task}")))?;

        let deadline = self.time_provider.now() + self.visibility_timeout;
        let rest = name.split_once('-').map(|(_, r)| r).unwrap_or(&name);
        tokio::fs::rename(
            self.inflight_dir().join(&name),
            self.inflight_dir().join(self.inflight_name(deadline, rest)),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, task: &Task) -> Result<(), TaskQueueError> {
        let name = self
            .find_inflight(task)
            .await?
            .ok_or_else(|| TaskQueueError::task_not_found(format!("task {task}")))?;
        tokio::fs::remove_file(self.inflight_dir().join(name)).await?;
        Ok(())
    }

    async fn size(&self) -> Result<usize, TaskQueueError> {
        let visible = self.dir_entries(&self.visible_dir()).await?.len();
        let inflight = self.dir_entries(&self.inflight_dir()).await?.len();
        Ok(visible + inflight)
    }
}
