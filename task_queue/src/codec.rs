//! The keyed-map wire envelope a [`Task`] travels in.
//!
//! Field names are part of the queue contract and shared with every other
//! consumer of the queue; `storeId` duplicates the source store id for
//! compatibility with older workers that predate explicit source/destination
//! fields.

use crate::TaskQueueError;
use data_types::{Account, ContentId, SpaceId, StoreId, Task, TaskKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "task-type")]
    task_type: String,
    account: String,
    #[serde(rename = "spaceId")]
    space_id: String,
    #[serde(rename = "contentId")]
    content_id: String,
    #[serde(rename = "storeId")]
    store_id: String,
    #[serde(rename = "sourceStoreId")]
    source_store_id: String,
    #[serde(rename = "destStoreId")]
    dest_store_id: String,
    attempts: u32,
}

/// Serialize a task into its wire envelope.
pub fn write_task(task: &Task) -> Result<String, TaskQueueError> {
    let envelope = Envelope {
        task_type: task.kind.as_str().to_owned(),
        account: task.account.as_str().to_owned(),
        space_id: task.space_id.as_str().to_owned(),
        content_id: task
            .content_id
            .as_ref()
            .map(|c| c.as_str().to_owned())
            .unwrap_or_default(),
        store_id: task.src_store.as_str().to_owned(),
        source_store_id: task.src_store.as_str().to_owned(),
        dest_store_id: task.dst_store.as_str().to_owned(),
        attempts: task.attempts,
    };
    serde_json::to_string(&envelope).map_err(TaskQueueError::invalid_envelope)
}

/// Deserialize a wire envelope back into a task.
pub fn read_task(payload: &str) -> Result<Task, TaskQueueError> {
    let envelope: Envelope =
        serde_json::from_str(payload).map_err(TaskQueueError::invalid_envelope)?;

    let kind = TaskKind::try_from_str(&envelope.task_type).ok_or_else(|| {
        TaskQueueError::invalid_envelope(format!("unknown task type {:?}", envelope.task_type))
    })?;

    // older producers only filled `storeId`
    let src_store = if envelope.source_store_id.is_empty() {
        envelope.store_id
    } else {
        envelope.source_store_id
    };

    let content_id = if envelope.content_id.is_empty() {
        None
    } else {
        Some(ContentId::new(envelope.content_id))
    };

    Ok(Task {
        kind,
        account: Account::new(envelope.account),
        space_id: SpaceId::new(envelope.space_id),
        content_id,
        src_store: StoreId::new(src_store),
        dst_store: StoreId::new(envelope.dest_store_id),
        attempts: envelope.attempts,
    })
}
