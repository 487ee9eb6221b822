//! The looping task producer: a resumable, bounded, fair enumerator that
//! turns (tenants x spaces x replication policies x content ids) into
//! discrete duplication tasks and feeds them to the work queue.
//!
//! Progress is tracked as morsels. The producer fills the queue up to a
//! soft ceiling, checkpointing the unfinished morsel set after every slice
//! of work, so an interrupted run resumes where it stopped instead of
//! re-enumerating multi-million-object spaces from the beginning.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use backoff::{Backoff, BackoffConfig};
use data_types::{Account, ContentId, Morsel, SpaceId, StoreId, Task, TaskIdentity, TenantPolicy};
use observability_deps::tracing::{debug, info};
use snafu::{ResultExt, Snafu};
use state_store::StateStore;
use std::{
    collections::{BTreeMap, HashSet},
    ops::ControlFlow,
    sync::Arc,
};
use storage::{StorageError, StorageProvider, StorageResolver};
use task_queue::{TaskQueue, TaskQueueError};
use tokio_util::sync::CancellationToken;

mod membership;
pub mod morsel_queue;
pub mod selection;
mod sweep;

pub use morsel_queue::MorselQueue;
pub use selection::Selection;

/// Content ids fetched from the source per nibble, at most.
pub const LISTING_PAGE_SIZE: usize = 1000;

/// Tasks flushed to the queue per `put_batch` call.
pub const TASK_BATCH_SIZE: usize = 10;

/// Errors that abort a producer run.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Loading persisted morsels: {}", source))]
    LoadState { source: state_store::Error },

    #[snafu(display("Persisting morsels: {}", source))]
    SaveState { source: state_store::Error },

    #[snafu(display("Task queue failure: {}", source))]
    Queue { source: TaskQueueError },

    #[snafu(display("Resolving provider for account {} store {}: {}", account, store_id, source))]
    ResolveProvider {
        account: Account,
        store_id: StoreId,
        source: StorageError,
    },

    #[snafu(display("Listing space {}/{}: {}", account, space_id, source))]
    ListSpace {
        account: Account,
        space_id: SpaceId,
        source: StorageError,
    },

    #[snafu(display("Deletion sweep over {}/{}: {}", account, space_id, source))]
    SweepStorage {
        account: Account,
        space_id: SpaceId,
        source: StorageError,
    },

    #[snafu(display("Membership set spill: {}", source))]
    Membership { source: std::io::Error },
}

/// Tunables for a [`LoopingTaskProducer`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Soft ceiling on outstanding tasks in the queue. The producer stops
    /// filling once the observed (advisory) depth reaches it.
    pub max_task_queue_size: usize,

    /// Retry policy for queue, state and storage I/O.
    pub backoff_config: BackoffConfig,

    /// In-memory digests buffered by the deletion sweep before spilling a
    /// sorted segment to disk.
    pub sweep_spill_threshold: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_task_queue_size: 1000,
            backoff_config: BackoffConfig::default(),
            sweep_spill_threshold: 500_000,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Tasks handed to the queue this run.
    pub tasks_enqueued: usize,
    /// Morsels checkpointed for the next run.
    pub morsels_remaining: usize,
}

/// Deduplicating, batching funnel from the producer into the task queue.
///
/// An identity set spanning the whole run prevents double-enqueues; tasks
/// are flushed in small batches.
pub(crate) struct TaskSink<'a> {
    queue: &'a dyn TaskQueue,
    backoff_config: &'a BackoffConfig,
    seen: &'a mut HashSet<TaskIdentity>,
    batch: Vec<Task>,
    pub(crate) enqueued: usize,
}

impl<'a> TaskSink<'a> {
    pub(crate) fn new(
        queue: &'a dyn TaskQueue,
        backoff_config: &'a BackoffConfig,
        seen: &'a mut HashSet<TaskIdentity>,
    ) -> Self {
        Self {
            queue,
            backoff_config,
            seen,
            batch: Vec::with_capacity(TASK_BATCH_SIZE),
            enqueued: 0,
        }
    }

    /// Queue a task for the next flush unless its identity was already
    /// enqueued this run. Returns whether the task was fresh.
    pub(crate) async fn push(&mut self, task: Task) -> Result<bool, Error> {
        if !self.seen.insert(task.identity()) {
            return Ok(false);
        }
        self.batch.push(task);
        if self.batch.len() >= TASK_BATCH_SIZE {
            self.flush().await?;
        }
        Ok(true)
    }

    /// Hand any buffered tasks to the queue.
    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let queue = self.queue;
        let batch = &self.batch;
        Backoff::new(self.backoff_config)
            .retry_all_errors("enqueue task batch", || queue.put_batch(batch))
            .await
            .context(QueueSnafu)?;
        self.enqueued += self.batch.len();
        self.batch.clear();
        Ok(())
    }
}

/// Fetch one listing page with retries. `NotFound` (the space itself is
/// absent) is surfaced to the caller immediately instead of being retried.
pub(crate) async fn fetch_chunk(
    provider: &dyn StorageProvider,
    space_id: &SpaceId,
    marker: Option<&ContentId>,
    limit: usize,
    backoff_config: &BackoffConfig,
) -> Result<Vec<ContentId>, StorageError> {
    Backoff::new(backoff_config)
        .retry_with_backoff("list space chunk", || {
            let fut = provider.list_space_chunk(space_id, marker, limit);
            async move {
                match fut.await {
                    Ok(page) => ControlFlow::Break(Ok(page)),
                    Err(e) if e.is_not_found() => ControlFlow::Break(Err(e)),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
}

/// Enumerates content per policy and feeds the duplication queue, resuming
/// from persisted progress and checkpointing after every nibble.
#[derive(Debug)]
pub struct LoopingTaskProducer {
    state_store: Arc<dyn StateStore>,
    queue: Arc<dyn TaskQueue>,
    resolver: Arc<dyn StorageResolver>,
    selection: Selection,
    config: ProducerConfig,
}

impl LoopingTaskProducer {
    /// Create a producer over the given collaborators.
    pub fn new(
        state_store: Arc<dyn StateStore>,
        queue: Arc<dyn TaskQueue>,
        resolver: Arc<dyn StorageResolver>,
        selection: Selection,
        config: ProducerConfig,
    ) -> Self {
        Self {
            state_store,
            queue,
            resolver,
            selection,
            config,
        }
    }

    /// Run one producer pass over the current policy snapshot.
    ///
    /// Persisted morsels are merged with freshly expanded ones (persisted
    /// markers win), then drained fairly until the queue ceiling is hit,
    /// every morsel is exhausted, or `shutdown` fires. The morsel set is
    /// checkpointed after every nibble, and once more on the way out.
    pub async fn run(
        &self,
        policies: &BTreeMap<Account, TenantPolicy>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, Error> {
        let persisted = self.state_store.load().await.context(LoadStateSnafu)?;
        let persisted_count = persisted.len();

        let mut morsel_queue = MorselQueue::new();
        // persisted first, so saved markers take precedence over fresh
        // expansion of the same identity
        morsel_queue.add_all(
            persisted
                .into_iter()
                .filter(|m| self.selection.allows(&m.account, &m.space_id)),
        );
        for (account, policy) in policies {
            for (space_id, store_policies) in policy.iter() {
                if !self.selection.allows(account, space_id) {
                    continue;
                }
                for store_policy in store_policies {
                    morsel_queue.push(Morsel::new(
                        account.clone(),
                        space_id.clone(),
                        store_policy.clone(),
                    ));
                }
            }
        }
        info!(
            morsels = morsel_queue.len(),
            persisted = persisted_count,
            "starting producer run"
        );

        let mut seen: HashSet<TaskIdentity> = HashSet::new();
        let mut morsels_to_reload: Vec<Morsel> = Vec::new();
        let mut tasks_enqueued = 0usize;

        loop {
            if shutdown.is_cancelled() {
                info!("shutdown requested, stopping producer run");
                break;
            }

            let depth = self.queue_depth().await?;
            if depth >= self.config.max_task_queue_size {
                info!(
                    depth,
                    ceiling = self.config.max_task_queue_size,
                    "queue ceiling reached, stopping producer run"
                );
                break;
            }

            let morsel = match morsel_queue.poll() {
                Some(morsel) => morsel,
                None => {
                    if morsels_to_reload.is_empty() {
                        debug!("all morsels exhausted");
                        break;
                    }
                    morsel_queue.add_all(morsels_to_reload.drain(..));
                    continue;
                }
            };

            self.nibble(
                morsel,
                depth,
                &mut seen,
                &mut morsels_to_reload,
                &mut tasks_enqueued,
            )
            .await?;

            self.persist(&morsel_queue, &morsels_to_reload).await?;
        }

        self.persist(&morsel_queue, &morsels_to_reload).await?;

        let morsels_remaining = morsel_queue.len() + morsels_to_reload.len();
        info!(tasks_enqueued, morsels_remaining, "producer run complete");
        Ok(RunSummary {
            tasks_enqueued,
            morsels_remaining,
        })
    }

    /// Take one slice out of a morsel: sweep on first touch, then up to a
    /// page of content ids turned into deduplicated tasks.
    async fn nibble(
        &self,
        mut morsel: Morsel,
        depth: usize,
        seen: &mut HashSet<TaskIdentity>,
        morsels_to_reload: &mut Vec<Morsel>,
        tasks_enqueued: &mut usize,
    ) -> Result<(), Error> {
        let src = self.resolve(&morsel.account, &morsel.store_policy.src_store)?;
        let dst = self.resolve(&morsel.account, &morsel.store_policy.dst_store)?;

        let mut sink = TaskSink::new(
            self.queue.as_ref(),
            &self.config.backoff_config,
            seen,
        );

        // the sweep runs once per pass over a space, before any marker exists
        if morsel.marker.is_none() {
            sweep::deletion_sweep(
                src.as_ref(),
                dst.as_ref(),
                &morsel,
                self.config.sweep_spill_threshold,
                &self.config.backoff_config,
                &mut sink,
            )
            .await?;
        }

        // stay near the ceiling instead of overshooting by a whole page
        let limit = LISTING_PAGE_SIZE
            .min(self.config.max_task_queue_size.saturating_sub(depth))
            .max(1);

        let page = match fetch_chunk(
            src.as_ref(),
            &morsel.space_id,
            morsel.marker.as_ref(),
            limit,
            &self.config.backoff_config,
        )
        .await
        {
            Ok(page) => page,
            Err(e) if e.is_not_found() => {
                info!(morsel=%morsel, "source space does not exist, nothing to enumerate");
                Vec::new()
            }
            Err(e) => {
                return Err(e).context(ListSpaceSnafu {
                    account: morsel.account.clone(),
                    space_id: morsel.space_id.clone(),
                })
            }
        };

        if page.is_empty() {
            sink.flush().await?;
            *tasks_enqueued += sink.enqueued;
            debug!(morsel=%morsel, "space exhausted, discarding morsel");
            return Ok(());
        }

        let mut fresh = 0usize;
        for id in &page {
            let task = Task::duplicate(
                morsel.account.clone(),
                morsel.space_id.clone(),
                Some(id.clone()),
                &morsel.store_policy,
            );
            if sink.push(task).await? {
                fresh += 1;
            }
        }
        sink.flush().await?;
        *tasks_enqueued += sink.enqueued;

        if fresh == 0 {
            // every id was already enqueued this run; that is lack of new
            // work, not completion - keep walking the space
            debug!(morsel=%morsel, "page held no new tasks, advancing marker without enqueues");
        }

        morsel.marker = Some(page.last().expect("page is non-empty").clone());
        morsels_to_reload.push(morsel);
        Ok(())
    }

    async fn queue_depth(&self) -> Result<usize, Error> {
        Backoff::new(&self.config.backoff_config)
            .retry_all_errors("observe queue depth", || self.queue.size())
            .await
            .context(QueueSnafu)
    }

    fn resolve(
        &self,
        account: &Account,
        store_id: &StoreId,
    ) -> Result<Arc<dyn StorageProvider>, Error> {
        self.resolver
            .resolve(account, store_id)
            .context(ResolveProviderSnafu {
                account: account.clone(),
                store_id: store_id.clone(),
            })
    }

    async fn persist(
        &self,
        morsel_queue: &MorselQueue,
        morsels_to_reload: &[Morsel],
    ) -> Result<(), Error> {
        let snapshot: Vec<Morsel> = morsel_queue
            .iter()
            .chain(morsels_to_reload.iter())
            .cloned()
            .collect();
        self.state_store
            .save(&snapshot)
            .await
            .context(SaveStateSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use data_types::StorePolicy;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use state_store::InMemoryStateStore;
    use storage::{mem::InMemoryStorage, ContentProperties, MapResolver};
    use task_queue::mem::InMemoryTaskQueue;
    use std::time::Duration;

    const SRC: &str = "0";
    const DST: &str = "1";

    fn account() -> Account {
        Account::new("acme")
    }

    fn space() -> SpaceId {
        SpaceId::new("photos")
    }

    fn policy() -> StorePolicy {
        StorePolicy::new(StoreId::new(SRC), StoreId::new(DST))
    }

    fn policies() -> BTreeMap<Account, TenantPolicy> {
        let mut tenant = TenantPolicy::new();
        tenant.add(space(), policy());
        BTreeMap::from([(account(), tenant)])
    }

    struct Fixture {
        src: Arc<InMemoryStorage>,
        dst: Arc<InMemoryStorage>,
        queue: Arc<InMemoryTaskQueue>,
        state: Arc<InMemoryStateStore>,
        resolver: Arc<MapResolver>,
    }

    fn fixture() -> Fixture {
        test_helpers::maybe_start_logging();

        let src = Arc::new(InMemoryStorage::new());
        let dst = Arc::new(InMemoryStorage::new());
        let resolver = Arc::new(MapResolver::new());
        resolver.register(
            account(),
            StoreId::new(SRC),
            Arc::clone(&src) as Arc<dyn StorageProvider>,
        );
        resolver.register(
            account(),
            StoreId::new(DST),
            Arc::clone(&dst) as Arc<dyn StorageProvider>,
        );

        Fixture {
            src,
            dst,
            queue: Arc::new(InMemoryTaskQueue::new(
                Duration::from_secs(60),
                Arc::new(clock::SystemProvider::new()),
            )),
            state: Arc::new(InMemoryStateStore::new()),
            resolver,
        }
    }

    fn producer(f: &Fixture, ceiling: usize) -> LoopingTaskProducer {
        let config = ProducerConfig {
            max_task_queue_size: ceiling,
            backoff_config: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                base: 1.1,
                max_attempts: 3,
            },
            sweep_spill_threshold: 8,
        };
        LoopingTaskProducer::new(
            Arc::clone(&f.state) as Arc<dyn StateStore>,
            Arc::clone(&f.queue) as Arc<dyn TaskQueue>,
            Arc::clone(&f.resolver) as Arc<dyn StorageResolver>,
            Selection::allow_all(),
            config,
        )
    }

    async fn seed(store: &InMemoryStorage, ids: &[&str]) {
        store.create_space(&space()).await.unwrap();
        for id in ids {
            let body = format!("body of {id}").into_bytes();
            let len = body.len() as u64;
            store
                .put_content(
                    &space(),
                    &ContentId::new(*id),
                    "text/plain",
                    ContentProperties::new(),
                    len,
                    None,
                    futures::stream::iter([Ok(Bytes::from(body))]).boxed(),
                )
                .await
                .unwrap();
        }
    }

    async fn drain(queue: &InMemoryTaskQueue) -> Vec<Task> {
        let mut tasks = Vec::new();
        loop {
            match queue.take().await {
                Ok(task) => {
                    queue.delete(&task).await.unwrap();
                    tasks.push(task);
                }
                Err(e) if e.is_timeout() => return tasks,
                Err(e) => panic!("unexpected queue error: {e}"),
            }
        }
    }

    fn content_ids(tasks: &[Task]) -> Vec<&str> {
        tasks
            .iter()
            .map(|t| t.content_id.as_ref().expect("content task").as_str())
            .collect()
    }

    #[tokio::test]
    async fn copies_new_content() {
        let f = fixture();
        seed(&f.src, &["a", "b"]).await;

        let summary = producer(&f, 100)
            .run(&policies(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.tasks_enqueued, 2);
        assert_eq!(summary.morsels_remaining, 0);

        let tasks = f.queue.visible_tasks();
        assert_eq!(content_ids(&tasks), vec!["a", "b"]);
        for task in &tasks {
            assert_eq!(task.account, account());
            assert_eq!(task.src_store, StoreId::new(SRC));
            assert_eq!(task.dst_store, StoreId::new(DST));
        }
        assert!(f.state.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_emits_delete_task_for_stray_content_first() {
        let f = fixture();
        seed(&f.src, &["a"]).await;
        seed(&f.dst, &["a", "stray"]).await;

        producer(&f, 100)
            .run(&policies(), CancellationToken::new())
            .await
            .unwrap();

        // delete task for the stray id precedes the content task
        let tasks = f.queue.visible_tasks();
        assert_eq!(content_ids(&tasks), vec!["stray", "a"]);
    }

    #[tokio::test]
    async fn sweep_spills_to_disk_and_stays_sound() {
        let f = fixture();
        // spill threshold in the test config is 8; 30 source ids force spills
        let src_ids: Vec<String> = (0..30).map(|n| format!("src-{n:03}")).collect();
        let src_refs: Vec<&str> = src_ids.iter().map(String::as_str).collect();
        seed(&f.src, &src_refs).await;

        let mut dst_ids = src_ids.clone();
        dst_ids.push("stray-1".to_owned());
        dst_ids.push("stray-2".to_owned());
        let dst_refs: Vec<&str> = dst_ids.iter().map(String::as_str).collect();
        seed(&f.dst, &dst_refs).await;

        producer(&f, 1000)
            .run(&policies(), CancellationToken::new())
            .await
            .unwrap();

        let tasks = f.queue.visible_tasks();
        // 30 content tasks plus exactly the two strays, none of the shared ids
        assert_eq!(tasks.len(), 32);
        let ids = content_ids(&tasks);
        assert_eq!(ids.iter().filter(|i| i.starts_with("stray")).count(), 2);
    }

    #[tokio::test]
    async fn ceiling_bounds_each_run_and_marker_resumes() {
        let f = fixture();
        let ids: Vec<String> = (1..=50).map(|n| format!("item_{n:02}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        seed(&f.src, &id_refs).await;

        let p = producer(&f, 5);
        p.run(&policies(), CancellationToken::new()).await.unwrap();

        assert_eq!(f.queue.size().await.unwrap(), 5);
        let morsels = f.state.load().await.unwrap();
        assert_eq!(morsels.len(), 1);
        assert_eq!(morsels[0].marker, Some(ContentId::new("item_05")));

        // drain and rerun until no morsels survive; markers only advance
        let mut collected: Vec<Task> = drain(&f.queue).await;
        let mut last_marker = morsels[0].marker.clone().unwrap();
        loop {
            let summary = p.run(&policies(), CancellationToken::new()).await.unwrap();
            collected.extend(drain(&f.queue).await);

            let morsels = f.state.load().await.unwrap();
            if summary.morsels_remaining == 0 {
                assert!(morsels.is_empty());
                break;
            }
            let marker = morsels[0].marker.clone().expect("marker after progress");
            assert!(marker >= last_marker, "marker went backwards");
            last_marker = marker;
        }

        let unique: HashSet<TaskIdentity> = collected.iter().map(Task::identity).collect();
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn interrupted_runs_produce_the_same_tasks_as_one_pass() {
        let ids: Vec<String> = (0..23).map(|n| format!("c-{n:02}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let straight = fixture();
        seed(&straight.src, &id_refs).await;
        producer(&straight, 1000)
            .run(&policies(), CancellationToken::new())
            .await
            .unwrap();
        let expected: HashSet<TaskIdentity> = drain(&straight.queue)
            .await
            .iter()
            .map(Task::identity)
            .collect();

        let chopped = fixture();
        seed(&chopped.src, &id_refs).await;
        let p = producer(&chopped, 7);
        let mut actual: HashSet<TaskIdentity> = HashSet::new();
        loop {
            let summary = p.run(&policies(), CancellationToken::new()).await.unwrap();
            actual.extend(drain(&chopped.queue).await.iter().map(Task::identity));
            if summary.morsels_remaining == 0 {
                break;
            }
        }

        assert_eq!(actual, expected);
    }

    /// Queue wrapper recording every `put_batch` call.
    #[derive(Debug)]
    struct RecordingQueue {
        inner: InMemoryTaskQueue,
        batches: Mutex<Vec<Vec<Task>>>,
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        async fn put_batch(&self, tasks: &[Task]) -> Result<(), TaskQueueError> {
            self.batches.lock().push(tasks.to_vec());
            self.inner.put_batch(tasks).await
        }

        async fn take(&self) -> Result<Task, TaskQueueError> {
            self.inner.take().await
        }

        async fn extend_visibility(&self, task: &Task) -> Result<(), TaskQueueError> {
            self.inner.extend_visibility(task).await
        }

        async fn delete(&self, task: &Task) -> Result<(), TaskQueueError> {
            self.inner.delete(task).await
        }

        async fn size(&self) -> Result<usize, TaskQueueError> {
            self.inner.size().await
        }
    }

    #[tokio::test]
    async fn batches_are_small_and_never_repeat_an_identity() {
        let f = fixture();
        let ids: Vec<String> = (0..25).map(|n| format!("c-{n:02}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        seed(&f.src, &id_refs).await;

        let recording = Arc::new(RecordingQueue {
            inner: InMemoryTaskQueue::new(
                Duration::from_secs(60),
                Arc::new(clock::SystemProvider::new()),
            ),
            batches: Mutex::new(Vec::new()),
        });
        let p = LoopingTaskProducer::new(
            Arc::clone(&f.state) as Arc<dyn StateStore>,
            Arc::clone(&recording) as Arc<dyn TaskQueue>,
            Arc::clone(&f.resolver) as Arc<dyn StorageResolver>,
            Selection::allow_all(),
            ProducerConfig {
                max_task_queue_size: 1000,
                ..ProducerConfig::default()
            },
        );
        p.run(&policies(), CancellationToken::new()).await.unwrap();

        let batches = recording.batches.lock();
        let mut seen = HashSet::new();
        for batch in batches.iter() {
            assert!(batch.len() <= TASK_BATCH_SIZE);
            for task in batch {
                assert!(seen.insert(task.identity()), "identity enqueued twice");
            }
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn all_duplicate_page_still_advances_the_marker() {
        let f = fixture();
        seed(&f.src, &["x", "y"]).await;

        let p = producer(&f, 100);
        let mut seen: HashSet<TaskIdentity> = ["x", "y"]
            .into_iter()
            .map(|id| {
                Task::duplicate(account(), space(), Some(ContentId::new(id)), &policy())
                    .identity()
            })
            .collect();
        let mut reload = Vec::new();
        let mut enqueued = 0;

        let morsel = Morsel::new(account(), space(), policy());
        p.nibble(morsel, 0, &mut seen, &mut reload, &mut enqueued)
            .await
            .unwrap();

        // nothing was enqueued, but the morsel kept walking the space
        assert_eq!(enqueued, 0);
        assert_eq!(reload.len(), 1);
        assert_eq!(reload[0].marker, Some(ContentId::new("y")));
    }

    #[tokio::test]
    async fn selection_lists_gate_morsels() {
        let f = fixture();
        seed(&f.src, &["a"]).await;

        let mut tenant = TenantPolicy::new();
        tenant.add(space(), policy());
        tenant.add(SpaceId::new("scratch"), policy());
        let policies = BTreeMap::from([(account(), tenant)]);

        let p = LoopingTaskProducer::new(
            Arc::clone(&f.state) as Arc<dyn StateStore>,
            Arc::clone(&f.queue) as Arc<dyn TaskQueue>,
            Arc::clone(&f.resolver) as Arc<dyn StorageResolver>,
            Selection::from_lists(None, Some("acme/scratch")),
            ProducerConfig::default(),
        );
        p.run(&policies, CancellationToken::new()).await.unwrap();

        let tasks = f.queue.visible_tasks();
        assert!(tasks.iter().all(|t| t.space_id == space()));
    }

    #[tokio::test]
    async fn cancelled_run_checkpoints_merged_morsels() {
        let f = fixture();
        seed(&f.src, &["a"]).await;

        let token = CancellationToken::new();
        token.cancel();
        let summary = producer(&f, 100).run(&policies(), token).await.unwrap();

        assert_eq!(summary.tasks_enqueued, 0);
        assert_eq!(summary.morsels_remaining, 1);
        let morsels = f.state.load().await.unwrap();
        assert_eq!(morsels, vec![Morsel::new(account(), space(), policy())]);
    }

    #[tokio::test]
    async fn full_queue_stops_the_run_before_any_nibble() {
        let f = fixture();
        seed(&f.src, &["a", "b"]).await;

        // pre-fill the queue beyond the ceiling
        let filler: Vec<Task> = (0..3)
            .map(|n| {
                Task::duplicate(
                    Account::new("other"),
                    space(),
                    Some(ContentId::new(format!("f-{n}"))),
                    &policy(),
                )
            })
            .collect();
        f.queue.put_batch(&filler).await.unwrap();

        let summary = producer(&f, 3)
            .run(&policies(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.tasks_enqueued, 0);
        assert_eq!(summary.morsels_remaining, 1);
        assert_eq!(f.queue.size().await.unwrap(), 3);
    }
}
