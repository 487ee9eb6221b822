//! In-memory [`StorageProvider`] implementation.
//!
//! The backing map lives behind a read-write mutex; fault-injection knobs
//! let tests exercise the retry and checksum-verification paths.

use crate::{
    md5_hex, ContentProperties, ContentStream, StorageError, StorageProvider, PROP_CHECKSUM,
    PROP_MIMETYPE, PROP_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use data_types::{ContentId, SpaceId};
use futures::StreamExt;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone)]
struct StoredContent {
    bytes: Bytes,
    props: ContentProperties,
}

/// An in-memory object store.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    spaces: RwLock<BTreeMap<SpaceId, BTreeMap<ContentId, StoredContent>>>,
    fail_puts: AtomicUsize,
    corrupt_gets: AtomicUsize,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `put_content` calls fail with an I/O error.
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `get_content` calls return corrupted bytes.
    pub fn corrupt_next_gets(&self, n: usize) {
        self.corrupt_gets.store(n, Ordering::SeqCst);
    }

    /// Replace the stored properties of a content item verbatim, bypassing
    /// the synthesized-key discipline. Test setup only.
    pub fn overwrite_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        props: ContentProperties,
    ) {
        let mut spaces = self.spaces.write();
        let content = spaces
            .get_mut(space_id)
            .and_then(|s| s.get_mut(content_id))
            .expect("content to overwrite exists");
        content.props = props;
    }

    /// Content ids currently stored in a space, for assertions.
    pub fn content_ids(&self, space_id: &SpaceId) -> Vec<ContentId> {
        self.spaces
            .read()
            .get(space_id)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn take_ticket(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn space_exists(&self, space_id: &SpaceId) -> Result<bool, StorageError> {
        Ok(self.spaces.read().contains_key(space_id))
    }

    async fn create_space(&self, space_id: &SpaceId) -> Result<(), StorageError> {
        self.spaces.write().entry(space_id.clone()).or_default();
        Ok(())
    }

    async fn delete_space(&self, space_id: &SpaceId) -> Result<(), StorageError> {
        match self.spaces.write().remove(space_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(format!("space {space_id}"))),
        }
    }

    async fn list_space_chunk(
        &self,
        space_id: &SpaceId,
        marker: Option<&ContentId>,
        limit: usize,
    ) -> Result<Vec<ContentId>, StorageError> {
        let spaces = self.spaces.read();
        let space = spaces
            .get(space_id)
            .ok_or_else(|| StorageError::not_found(format!("space {space_id}")))?;

        let lower = match marker {
            Some(m) => Bound::Excluded(m.clone()),
            None => Bound::Unbounded,
        };
        Ok(space
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn get_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<Option<ContentProperties>, StorageError> {
        Ok(self
            .spaces
            .read()
            .get(space_id)
            .and_then(|s| s.get(content_id))
            .map(|c| c.props.clone()))
    }

    async fn set_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        props: ContentProperties,
    ) -> Result<(), StorageError> {
        let mut spaces = self.spaces.write();
        let content = spaces
            .get_mut(space_id)
            .and_then(|s| s.get_mut(content_id))
            .ok_or_else(|| {
                StorageError::not_found(format!("content {space_id}/{content_id}"))
            })?;

        let mut next = props;
        for key in [PROP_CHECKSUM, PROP_SIZE] {
            if let Some(v) = content.props.get(key) {
                next.insert(key, v.to_owned());
            }
        }
        content.props = next;
        Ok(())
    }

    async fn get_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<ContentStream, StorageError> {
        let bytes = self
            .spaces
            .read()
            .get(space_id)
            .and_then(|s| s.get(content_id))
            .map(|c| c.bytes.clone())
            .ok_or_else(|| {
                StorageError::not_found(format!("content {space_id}/{content_id}"))
            })?;

        let bytes = if Self::take_ticket(&self.corrupt_gets) {
            let mut corrupted = bytes.to_vec();
            match corrupted.first_mut() {
                Some(b) => *b = b.wrapping_add(1),
                None => corrupted.push(0xff),
            }
            Bytes::from(corrupted)
        } else {
            bytes
        };

        Ok(futures::stream::iter([Ok(bytes)]).boxed())
    }

    async fn put_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        mimetype: &str,
        props: ContentProperties,
        length: u64,
        expected_checksum: Option<&str>,
        mut stream: ContentStream,
    ) -> Result<String, StorageError> {
        if Self::take_ticket(&self.fail_puts) {
            return Err(StorageError::new(
                crate::StorageErrorKind::IO,
                "injected put failure",
            ));
        }

        let mut buf = Vec::with_capacity(length as usize);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        if buf.len() as u64 != length {
            return Err(StorageError::invalid_input(format!(
                "declared length {length} but received {} bytes",
                buf.len()
            )));
        }

        let checksum = md5_hex(&buf);
        if let Some(expected) = expected_checksum {
            if expected != checksum {
                return Err(StorageError::checksum_mismatch(format!(
                    "expected {expected}, stored bytes hash to {checksum}"
                )));
            }
        }

        let mut props = props;
        props.insert(PROP_CHECKSUM, checksum.clone());
        props.insert(PROP_MIMETYPE, mimetype.to_owned());
        props.insert(PROP_SIZE, buf.len().to_string());

        let mut spaces = self.spaces.write();
        let space = spaces
            .get_mut(space_id)
            .ok_or_else(|| StorageError::not_found(format!("space {space_id}")))?;
        space.insert(
            content_id.clone(),
            StoredContent {
                bytes: buf.into(),
                props,
            },
        );

        Ok(checksum)
    }

    async fn delete_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<(), StorageError> {
        let mut spaces = self.spaces.write();
        let removed = spaces
            .get_mut(space_id)
            .and_then(|s| s.remove(content_id));
        match removed {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(format!(
                "content {space_id}/{content_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageErrorKind;
    use futures::TryStreamExt;

    fn stream_of(data: &'static [u8]) -> ContentStream {
        futures::stream::iter([Ok(Bytes::from_static(data))]).boxed()
    }

    async fn collect(stream: ContentStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        let id = ContentId::new("img-001");
        store.create_space(&space).await.unwrap();

        let checksum = store
            .put_content(
                &space,
                &id,
                "image/png",
                ContentProperties::new(),
                5,
                None,
                stream_of(b"hello"),
            )
            .await
            .unwrap();
        assert_eq!(checksum, md5_hex(b"hello"));

        let props = store
            .get_content_properties(&space, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(props.checksum(), Some(checksum.as_str()));
        assert_eq!(props.mimetype(), Some("image/png"));

        let body = collect(store.get_content(&space, &id).await.unwrap()).await;
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn put_rejects_checksum_mismatch() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        store.create_space(&space).await.unwrap();

        let err = store
            .put_content(
                &space,
                &ContentId::new("img-001"),
                "text/plain",
                ContentProperties::new(),
                5,
                Some("0000"),
                stream_of(b"hello"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::ChecksumMismatch);
        assert!(store.content_ids(&space).is_empty());
    }

    #[tokio::test]
    async fn listing_is_ordered_and_marker_exclusive() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        store.create_space(&space).await.unwrap();
        for name in ["c", "a", "b", "d"] {
            store
                .put_content(
                    &space,
                    &ContentId::new(name),
                    "text/plain",
                    ContentProperties::new(),
                    1,
                    None,
                    stream_of(b"x"),
                )
                .await
                .unwrap();
        }

        let chunk = store
            .list_space_chunk(&space, None, 10)
            .await
            .unwrap();
        assert_eq!(
            chunk,
            ["a", "b", "c", "d"].map(ContentId::new).to_vec()
        );

        let chunk = store
            .list_space_chunk(&space, Some(&ContentId::new("b")), 1)
            .await
            .unwrap();
        assert_eq!(chunk, vec![ContentId::new("c")]);
    }

    #[tokio::test]
    async fn streaming_listing_pages_through_the_space() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        store.create_space(&space).await.unwrap();
        let ids: Vec<String> = (0..25).map(|n| format!("img-{n:03}")).collect();
        for id in &ids {
            store
                .put_content(
                    &space,
                    &ContentId::new(id.clone()),
                    "text/plain",
                    ContentProperties::new(),
                    1,
                    None,
                    stream_of(b"x"),
                )
                .await
                .unwrap();
        }

        let all: Vec<ContentId> = store
            .list_space(&space, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all.first(), Some(&ContentId::new("img-000")));
        assert_eq!(all.last(), Some(&ContentId::new("img-024")));

        // restart from an opaque marker
        let rest: Vec<ContentId> = store
            .list_space(&space, Some(ContentId::new("img-020")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            rest,
            (21..25)
                .map(|n| ContentId::new(format!("img-{n:03}")))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn set_properties_preserves_synthesized_keys() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        let id = ContentId::new("img-001");
        store.create_space(&space).await.unwrap();
        let checksum = store
            .put_content(
                &space,
                &id,
                "text/plain",
                ContentProperties::new(),
                5,
                None,
                stream_of(b"hello"),
            )
            .await
            .unwrap();

        let mut next = ContentProperties::new();
        next.insert("color", "blue");
        store
            .set_content_properties(&space, &id, next)
            .await
            .unwrap();

        let props = store
            .get_content_properties(&space, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(props.get("color"), Some("blue"));
        assert_eq!(props.checksum(), Some(checksum.as_str()));
    }

    #[tokio::test]
    async fn absent_content_is_none_not_error() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        store.create_space(&space).await.unwrap();

        let props = store
            .get_content_properties(&space, &ContentId::new("ghost"))
            .await
            .unwrap();
        assert!(props.is_none());

        let err = store
            .delete_content(&space, &ContentId::new("ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn corrupt_gets_flip_bytes_then_recover() {
        let store = InMemoryStorage::new();
        let space = SpaceId::new("photos");
        let id = ContentId::new("img-001");
        store.create_space(&space).await.unwrap();
        store
            .put_content(
                &space,
                &id,
                "text/plain",
                ContentProperties::new(),
                5,
                None,
                stream_of(b"hello"),
            )
            .await
            .unwrap();

        store.corrupt_next_gets(1);
        let corrupted = collect(store.get_content(&space, &id).await.unwrap()).await;
        assert_ne!(corrupted, b"hello");

        let clean = collect(store.get_content(&space, &id).await.unwrap()).await;
        assert_eq!(clean, b"hello");
    }
}
