//! The duplication task processor: given one (account, space, content,
//! source store, destination store) tuple, bring the destination into a
//! state consistent with the source.
//!
//! The processor is idempotent: re-running a converged task lands in the
//! no-op branch. That absorbs queue redelivery and mid-task crashes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use backoff::{Backoff, BackoffConfig};
use data_types::{Account, ContentId, SpaceId, StoreId, Task};
use observability_deps::tracing::{debug, info};
use snafu::{ResultExt, Snafu};
use std::{future::Future, ops::ControlFlow, sync::Arc};
use storage::{
    ContentProperties, StorageError, StorageErrorKind, StorageProvider, StorageResolver,
};

mod clean;
mod copy;

pub use clean::clean;
pub use copy::LOCAL_CHECKSUM_ATTEMPTS;

/// Fatal outcomes of task execution. The worker layer decides what happens
/// to the message afterwards; the processor guarantees its temp file is gone
/// before one of these propagates.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum TaskExecutionError {
    #[snafu(display("Task {} has an empty space id", task))]
    EmptySpaceId { task: String },

    #[snafu(display(
        "Source content {}/{}/{} has no checksum property",
        account,
        space_id,
        content_id
    ))]
    MissingSourceChecksum {
        account: Account,
        space_id: SpaceId,
        content_id: ContentId,
    },

    #[snafu(display(
        "Content {} read from source repeatedly hashed to {} instead of {}",
        content_id,
        actual,
        expected
    ))]
    SourceChecksumMismatch {
        content_id: ContentId,
        expected: String,
        actual: String,
    },

    #[snafu(display(
        "Destination stored content {} with checksum {} but source says {}",
        content_id,
        actual,
        expected
    ))]
    DestinationChecksumMismatch {
        content_id: ContentId,
        expected: String,
        actual: String,
    },

    #[snafu(display("Resolving provider for account {} store {}: {}", account, store_id, source))]
    ResolveProvider {
        account: Account,
        store_id: StoreId,
        source: StorageError,
    },

    #[snafu(display("Storage failure during {}: {}", operation, source))]
    Storage {
        operation: &'static str,
        source: StorageError,
    },

    #[snafu(display("Temp file for copy: {}", source))]
    TempFile { source: std::io::Error },
}

/// What executing a task actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Source and destination already agree.
    Noop,
    /// Content was copied to the destination; carries the verified checksum.
    Copied(String),
    /// Checksums agreed but properties had drifted; destination properties
    /// were rewritten from source.
    PropertiesUpdated,
    /// Content was removed from the destination.
    ContentDeleted,
    /// The destination space was created or confirmed present.
    SpaceEnsured,
    /// The (empty) destination space was deleted.
    SpaceDeleted,
}

/// Reconciles a single task between its source and destination stores.
#[derive(Debug)]
pub struct DuplicationTaskProcessor {
    resolver: Arc<dyn StorageResolver>,
    backoff_config: BackoffConfig,
}

impl DuplicationTaskProcessor {
    /// Create a processor resolving providers through `resolver`.
    pub fn new(resolver: Arc<dyn StorageResolver>, backoff_config: BackoffConfig) -> Self {
        Self {
            resolver,
            backoff_config,
        }
    }

    /// Execute one task to completion.
    pub async fn execute(&self, task: &Task) -> Result<Outcome, TaskExecutionError> {
        if task.space_id.is_empty() {
            return EmptySpaceIdSnafu {
                task: task.to_string(),
            }
            .fail();
        }

        let src = self.resolve(&task.account, &task.src_store)?;
        let dst = self.resolve(&task.account, &task.dst_store)?;

        let outcome = match &task.content_id {
            None => self.reconcile_space(task, src.as_ref(), dst.as_ref()).await?,
            Some(content_id) => {
                self.reconcile_content(task, content_id, src.as_ref(), dst.as_ref())
                    .await?
            }
        };
        debug!(task=%task, outcome=?outcome, "task executed");
        Ok(outcome)
    }

    /// Space-level reconciliation: mirror the existence of the source space.
    /// A destination space still holding content is never deleted.
    async fn reconcile_space(
        &self,
        task: &Task,
        src: &dyn StorageProvider,
        dst: &dyn StorageProvider,
    ) -> Result<Outcome, TaskExecutionError> {
        let space_id = &task.space_id;

        let src_exists = self
            .retry("spaceExists", || src.space_exists(space_id))
            .await?;
        if src_exists {
            self.ensure_space(dst, space_id).await?;
            return Ok(Outcome::SpaceEnsured);
        }

        let dst_exists = self
            .retry("spaceExists", || dst.space_exists(space_id))
            .await?;
        if !dst_exists {
            return Ok(Outcome::Noop);
        }

        let remaining = self
            .retry("listSpace", || dst.list_space_chunk(space_id, None, 1))
            .await;
        let remaining = match remaining {
            Ok(ids) => ids,
            // the space vanished underneath us, which is what we wanted
            Err(TaskExecutionError::Storage { source, .. }) if source.is_not_found() => {
                return Ok(Outcome::Noop)
            }
            Err(e) => return Err(e),
        };
        if !remaining.is_empty() {
            info!(task=%task, "destination space still holds content, leaving it alone");
            return Ok(Outcome::Noop);
        }

        match self
            .retry("deleteSpace", || dst.delete_space(space_id))
            .await
        {
            Ok(()) => Ok(Outcome::SpaceDeleted),
            Err(TaskExecutionError::Storage { source, .. }) if source.is_not_found() => {
                Ok(Outcome::Noop)
            }
            Err(e) => Err(e),
        }
    }

    /// Content-level reconciliation: the full present/absent/divergent case
    /// table over the two property fetches.
    async fn reconcile_content(
        &self,
        task: &Task,
        content_id: &ContentId,
        src: &dyn StorageProvider,
        dst: &dyn StorageProvider,
    ) -> Result<Outcome, TaskExecutionError> {
        let space_id = &task.space_id;

        self.ensure_space(dst, space_id).await?;

        let src_props = self
            .retry("getContentProperties", || {
                src.get_content_properties(space_id, content_id)
            })
            .await?;
        let dst_props = self
            .retry("getContentProperties", || {
                dst.get_content_properties(space_id, content_id)
            })
            .await?;

        let (src_props, src_checksum) = match (src_props, dst_props) {
            (None, None) => return Ok(Outcome::Noop),
            (None, Some(_)) => {
                // stray destination content; the source is the truth
                match self
                    .retry("deleteContent", || dst.delete_content(space_id, content_id))
                    .await
                {
                    Ok(()) => return Ok(Outcome::ContentDeleted),
                    Err(TaskExecutionError::Storage { source, .. })
                        if source.is_not_found() =>
                    {
                        return Ok(Outcome::Noop)
                    }
                    Err(e) => return Err(e),
                }
            }
            (Some(src_props), dst_props) => {
                let src_checksum = match src_props.checksum() {
                    Some(checksum) => checksum.to_owned(),
                    None => {
                        return MissingSourceChecksumSnafu {
                            account: task.account.clone(),
                            space_id: space_id.clone(),
                            content_id: content_id.clone(),
                        }
                        .fail()
                    }
                };

                if let Some(dst_props) = &dst_props {
                    if dst_props.checksum() == Some(src_checksum.as_str()) {
                        return if clean(&src_props) == clean(dst_props) {
                            Ok(Outcome::Noop)
                        } else {
                            self.write_properties(dst, space_id, content_id, &src_props)
                                .await?;
                            Ok(Outcome::PropertiesUpdated)
                        };
                    }
                }

                (src_props, src_checksum)
            }
        };

        let stored = copy::copy_content(
            src,
            dst,
            space_id,
            content_id,
            &src_props,
            &src_checksum,
            &self.backoff_config,
        )
        .await?;
        Ok(Outcome::Copied(stored))
    }

    async fn write_properties(
        &self,
        dst: &dyn StorageProvider,
        space_id: &SpaceId,
        content_id: &ContentId,
        src_props: &ContentProperties,
    ) -> Result<(), TaskExecutionError> {
        let cleaned = clean(src_props);
        self.retry("setContentProperties", || {
            dst.set_content_properties(space_id, content_id, cleaned.clone())
        })
        .await
    }

    /// Idempotent destination-space creation; an `AlreadyExists` answer from
    /// a driver counts as success.
    async fn ensure_space(
        &self,
        provider: &dyn StorageProvider,
        space_id: &SpaceId,
    ) -> Result<(), TaskExecutionError> {
        Backoff::new(&self.backoff_config)
            .retry_with_backoff("createSpace", || {
                let fut = provider.create_space(space_id);
                async move {
                    match fut.await {
                        Ok(()) => ControlFlow::Break(Ok(())),
                        Err(e) if e.kind() == StorageErrorKind::AlreadyExists => {
                            ControlFlow::Break(Ok(()))
                        }
                        Err(e) => ControlFlow::Continue(e),
                    }
                }
            })
            .await
            .context(StorageSnafu {
                operation: "createSpace",
            })
    }

    /// Retry a storage operation; `NotFound` is a domain answer and is
    /// surfaced immediately rather than retried.
    async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut f: F,
    ) -> Result<T, TaskExecutionError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        Backoff::new(&self.backoff_config)
            .retry_with_backoff(operation, || {
                let fut = f();
                async move {
                    match fut.await {
                        Ok(value) => ControlFlow::Break(Ok(value)),
                        Err(e) if e.is_not_found() => ControlFlow::Break(Err(e)),
                        Err(e) => ControlFlow::Continue(e),
                    }
                }
            })
            .await
            .context(StorageSnafu { operation })
    }

    fn resolve(
        &self,
        account: &Account,
        store_id: &StoreId,
    ) -> Result<Arc<dyn StorageProvider>, TaskExecutionError> {
        self.resolver
            .resolve(account, store_id)
            .context(ResolveProviderSnafu {
                account: account.clone(),
                store_id: store_id.clone(),
            })
    }
}
