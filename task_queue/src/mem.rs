//! In-memory [`TaskQueue`] implementation.
//!
//! Tasks are held as wire envelopes so the codec is exercised on every pass
//! through the queue. Visibility timeouts are driven by an injected
//! [`TimeProvider`]; expired in-flight tasks are redelivered at the back of
//! the visible queue.

use crate::{
    codec::{read_task, write_task},
    TaskQueue, TaskQueueError,
};
use async_trait::async_trait;
use clock::{Time, TimeProvider};
use data_types::{Task, TaskIdentity};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};

#[derive(Debug)]
struct InFlight {
    identity: TaskIdentity,
    payload: String,
    deadline: Time,
}

#[derive(Debug, Default)]
struct State {
    visible: VecDeque<String>,
    in_flight: Vec<InFlight>,
}

/// An in-memory queue with at-least-once semantics and visibility timeouts.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    visibility_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryTaskQueue {
    /// Create a queue with the given visibility timeout.
    pub fn new(visibility_timeout: Duration, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
            time_provider,
        }
    }

    /// Decoded copies of the currently visible tasks, oldest first. Test
    /// inspection helper; does not affect visibility.
    pub fn visible_tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .visible
            .iter()
            .map(|p| read_task(p).expect("queue holds valid envelopes"))
            .collect()
    }

    /// Number of tasks currently invisible to other takers.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Redrive any in-flight task whose visibility lapsed.
    fn redrive(state: &mut State, now: Time) {
        let mut i = 0;
        while i < state.in_flight.len() {
            if state.in_flight[i].deadline <= now {
                let expired = state.in_flight.swap_remove(i);
                debug!(space=%expired.identity.space_id, "visibility lapsed, redriving task");
                state.visible.push_back(expired.payload);
            } else {
                i += 1;
            }
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn put_batch(&self, tasks: &[Task]) -> Result<(), TaskQueueError> {
        let payloads = tasks
            .iter()
            .map(write_task)
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.state.lock();
        state.visible.extend(payloads);
        Ok(())
    }

    async fn take(&self) -> Result<Task, TaskQueueError> {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        Self::redrive(&mut state, now);

        let payload = state
            .visible
            .pop_front()
            .ok_or_else(|| TaskQueueError::timeout("queue is empty"))?;
        let task = read_task(&payload)?;
        state.in_flight.push(InFlight {
            identity: task.identity(),
            payload,
            deadline: now + self.visibility_timeout,
        });
        Ok(task)
    }

    async fn extend_visibility(&self, task: &Task) -> Result<(), TaskQueueError> {
        let now = self.time_provider.now();
        let identity = task.identity();
        let mut state = self.state.lock();

        let entry = state
            .in_flight
            .iter_mut()
            .find(|f| f.identity == identity)
            .ok_or_else(|| TaskQueueError::task_not_found(format!("task {task}")))?;
        entry.deadline = now + self.visibility_timeout;
        Ok(())
    }

    async fn delete(&self, task: &Task) -> Result<(), TaskQueueError> {
        let identity = task.identity();
        let mut state = self.state.lock();

        let idx = state
            .in_flight
            .iter()
            .position(|f| f.identity == identity)
            .ok_or_else(|| TaskQueueError::task_not_found(format!("task {task}")))?;
        state.in_flight.swap_remove(idx);
        Ok(())
    }

    async fn size(&self) -> Result<usize, TaskQueueError> {
        let state = self.state.lock();
        Ok(state.visible.len() + state.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::MockProvider;
    use data_types::{Account, ContentId, SpaceId, StoreId, StorePolicy};

    fn task(content: &str) -> Task {
        Task::duplicate(
            Account::new("acme"),
            SpaceId::new("photos"),
            Some(ContentId::new(content)),
            &StorePolicy::new(StoreId::new("0"), StoreId::new("1")),
        )
    }

    fn queue() -> (Arc<MockProvider>, InMemoryTaskQueue) {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let q = InMemoryTaskQueue::new(
            Duration::from_secs(30),
            Arc::clone(&time) as Arc<dyn TimeProvider>,
        );
        (time, q)
    }

    #[tokio::test]
    async fn fifo_take_and_delete() {
        let (_time, q) = queue();
        q.put_batch(&[task("a"), task("b")]).await.unwrap();
        assert_eq!(q.size().await.unwrap(), 2);

        let t = q.take().await.unwrap();
        assert_eq!(t.content_id, Some(ContentId::new("a")));
        // taken but not deleted still counts toward the advisory size
        assert_eq!(q.size().await.unwrap(), 2);

        q.delete(&t).await.unwrap();
        assert_eq!(q.size().await.unwrap(), 1);

        let err = q.delete(&t).await.unwrap_err();
        assert_eq!(err.kind(), crate::TaskQueueErrorKind::TaskNotFound);
    }

    #[tokio::test]
    async fn take_on_empty_times_out() {
        let (_time, q) = queue();
        let err = q.take().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn visibility_lapse_redelivers() {
        let (time, q) = queue();
        q.put_batch(&[task("a")]).await.unwrap();

        let t = q.take().await.unwrap();
        assert!(q.take().await.unwrap_err().is_timeout());

        time.inc(Duration::from_secs(31));
        let redelivered = q.take().await.unwrap();
        assert_eq!(redelivered, t);
    }

    #[tokio::test]
    async fn extend_visibility_defers_redelivery() {
        let (time, q) = queue();
        q.put_batch(&[task("a")]).await.unwrap();

        let t = q.take().await.unwrap();
        time.inc(Duration::from_secs(20));
        q.extend_visibility(&t).await.unwrap();

        // past the original deadline but within the extended one
        time.inc(Duration::from_secs(20));
        assert!(q.take().await.unwrap_err().is_timeout());

        time.inc(Duration::from_secs(11));
        assert_eq!(q.take().await.unwrap(), t);
    }

    #[tokio::test]
    async fn attempts_survive_the_wire() {
        let (_time, q) = queue();
        let mut t = task("a");
        t.attempts = 4;
        q.put_batch(&[t]).await.unwrap();
        assert_eq!(q.take().await.unwrap().attempts, 4);
    }
}
