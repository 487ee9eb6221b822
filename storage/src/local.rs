//! Local-filesystem [`StorageProvider`] implementation.
//!
//! Spaces are directories under a root; each content item is a file named by
//! its percent-encoded id plus a JSON property sidecar. Good enough for
//! single-node deployments and end-to-end tests without cloud credentials.

use crate::{
    hex_encode, ContentProperties, ContentStream, StorageError, StorageProvider, PROP_CHECKSUM,
    PROP_MIMETYPE, PROP_SIZE,
};
use async_trait::async_trait;
use data_types::{ContentId, SpaceId};
use futures::StreamExt;
use md5::{Digest, Md5};
use observability_deps::tracing::debug;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Everything but `[A-Za-z0-9_-]` is escaped, so encoded names never contain
/// path separators or dots and cannot collide with sidecar names.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

const SIDECAR_SUFFIX: &str = ".props.json";
const TMP_PREFIX: &str = ".tmp-";

fn encode(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_SAFE).to_string()
}

fn decode(encoded: &str) -> Result<String, StorageError> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| StorageError::unknown(format!("undecodable entry {encoded}: {e}")))
}

/// A [`StorageProvider`] rooted at a local directory.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a provider rooted at `root`. The root directory is created if
    /// missing; spaces inside it are not.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn space_dir(&self, space_id: &SpaceId) -> PathBuf {
        self.root.join(encode(space_id.as_str()))
    }

    fn content_path(&self, space_id: &SpaceId, content_id: &ContentId) -> PathBuf {
        self.space_dir(space_id).join(encode(content_id.as_str()))
    }

    fn sidecar_path(&self, space_id: &SpaceId, content_id: &ContentId) -> PathBuf {
        let mut name = encode(content_id.as_str());
        name.push_str(SIDECAR_SUFFIX);
        self.space_dir(space_id).join(name)
    }

    async fn read_sidecar(&self, path: &Path) -> Result<ContentProperties, StorageError> {
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StorageError::unknown(format!("corrupt sidecar {path:?}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ContentProperties::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sidecar(
        &self,
        path: &Path,
        props: &ContentProperties,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_vec_pretty(props)
            .map_err(|e| StorageError::unknown(format!("encoding sidecar: {e}")))?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn space_exists(&self, space_id: &SpaceId) -> Result<bool, StorageError> {
        match tokio::fs::metadata(self.space_dir(space_id)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_space(&self, space_id: &SpaceId) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.space_dir(space_id)).await?;
        Ok(())
    }

    async fn delete_space(&self, space_id: &SpaceId) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.space_dir(space_id)).await {
            Ok(()) => {
                debug!(space_id=%space_id, "space deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(format!("space {space_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_space_chunk(
        &self,
        space_id: &SpaceId,
        marker: Option<&ContentId>,
        limit: usize,
    ) -> Result<Vec<ContentId>, StorageError> {
        let dir = self.space_dir(space_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!("space {space_id}")))
            }
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(SIDECAR_SUFFIX) || name.starts_with(TMP_PREFIX) {
                continue;
            }
            ids.push(ContentId::new(decode(&name)?));
        }
        ids.sort();

        Ok(ids
            .into_iter()
            .filter(|id| marker.map(|m| id > m).unwrap_or(true))
            .take(limit)
            .collect())
    }

    async fn get_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<Option<ContentProperties>, StorageError> {
        match tokio::fs::metadata(self.content_path(space_id, content_id)).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let props = self
            .read_sidecar(&self.sidecar_path(space_id, content_id))
            .await?;
        Ok(Some(props))
    }

    async fn set_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        props: ContentProperties,
    ) -> Result<(), StorageError> {
        match tokio::fs::metadata(self.content_path(space_id, content_id)).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!(
                    "content {space_id}/{content_id}"
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let sidecar = self.sidecar_path(space_id, content_id);
        let old = self.read_sidecar(&sidecar).await?;

        let mut next = props;
        for key in [PROP_CHECKSUM, PROP_SIZE] {
            if let Some(v) = old.get(key) {
                next.insert(key, v.to_owned());
            }
        }
        self.write_sidecar(&sidecar, &next).await
    }

    async fn get_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<ContentStream, StorageError> {
        let file = match tokio::fs::File::open(self.content_path(space_id, content_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!(
                    "content {space_id}/{content_id}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ReaderStream::new(file).map(|r| r.map_err(Into::into)).boxed())
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
        let dir = self.space_dir(space_id);
        if !self.space_exists(space_id).await? {
            return Err(StorageError::not_found(format!("space {space_id}")));
        }

        let tmp_path = dir.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let mut hasher = Md5::new();
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                written += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);

            if written != length {
                return Err(StorageError::invalid_input(format!(
                    "declared length {length} but received {written} bytes"
                )));
            }

            let checksum = hex_encode(&hasher.finalize());
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
            props.insert(PROP_SIZE, written.to_string());

            tokio::fs::rename(&tmp_path, self.content_path(space_id, content_id)).await?;
            self.write_sidecar(&self.sidecar_path(space_id, content_id), &props)
                .await?;
            Ok(checksum)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn delete_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.content_path(space_id, content_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!(
                    "content {space_id}/{content_id}"
                )))
            }
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_file(self.sidecar_path(space_id, content_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
