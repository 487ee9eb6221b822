//! Contract for the durable, at-least-once work queue that connects the task
//! producer to the duplication workers, plus the wire envelope tasks travel
//! in and an in-memory implementation with visibility timeouts.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::Task;
use std::fmt::{Debug, Display, Formatter};

pub mod codec;
pub mod file;
pub mod mem;

/// Generic boxed error type for task queues.
#[derive(Debug)]
pub struct TaskQueueError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: TaskQueueErrorKind,
}

impl TaskQueueError {
    /// Wrap an arbitrary error with an explicit kind.
    pub fn new(
        kind: TaskQueueErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// There was nothing to take within the queue's wait window.
    pub fn timeout(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(TaskQueueErrorKind::Timeout, e)
    }

    /// The queue has no record of the given task.
    pub fn task_not_found(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(TaskQueueErrorKind::TaskNotFound, e)
    }

    /// The payload could not be decoded as a task envelope.
    pub fn invalid_envelope(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(TaskQueueErrorKind::InvalidEnvelope, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> TaskQueueErrorKind {
        self.kind
    }

    /// Shorthand for [`TaskQueueErrorKind::Timeout`] checks.
    pub fn is_timeout(&self) -> bool {
        self.kind == TaskQueueErrorKind::Timeout
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for TaskQueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskQueueError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for TaskQueueError {}

impl From<std::io::Error> for TaskQueueError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: TaskQueueErrorKind::IO,
        }
    }
}

/// Classification of a [`TaskQueueError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskQueueErrorKind {
    /// The queue was empty for the duration of the take call.
    Timeout,

    /// The task is unknown to the queue (already deleted, or its visibility
    /// expired and another worker deleted it).
    TaskNotFound,

    /// The payload did not round-trip through the envelope codec.
    InvalidEnvelope,

    /// A fatal IO error occurred - non-fatal errors should be retried
    /// internally by the queue driver.
    IO,

    /// This operation failed for an unknown reason.
    Unknown,
}

/// A durable, at-least-once FIFO-ish queue with visibility timeouts.
///
/// Taken tasks become invisible until deleted or until the visibility
/// timeout lapses, at which point the queue redelivers them. The queue may
/// redeliver even deleted-adjacent tasks under failure; consumers are
/// idempotent.
#[async_trait]
pub trait TaskQueue: Send + Sync + Debug + 'static {
    /// Enqueue a batch of tasks. Atomic within best effort; producers batch
    /// in small groups.
    async fn put_batch(&self, tasks: &[Task]) -> Result<(), TaskQueueError>;

    /// Take the next task, making it invisible for the visibility window.
    /// Fails `Timeout` when the queue is empty.
    async fn take(&self) -> Result<Task, TaskQueueError>;

    /// Push out the visibility deadline of an in-flight task. Fails
    /// `TaskNotFound` if the queue no longer tracks it.
    async fn extend_visibility(&self, task: &Task) -> Result<(), TaskQueueError>;

    /// Acknowledge and drop an in-flight task. Fails `TaskNotFound` if the
    /// queue no longer tracks it.
    async fn delete(&self, task: &Task) -> Result<(), TaskQueueError>;

    /// Approximate number of tasks in the queue (visible and in-flight).
    /// Advisory: the value may lag and is used only as a backpressure
    /// signal.
    async fn size(&self) -> Result<usize, TaskQueueError>;
}
