//! Persistence of producer progress: the set of in-flight morsels, written
//! and replaced as one durable blob per producer identity.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::Morsel;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

/// Errors from loading or replacing the persisted morsel set.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Reading state from {:?}: {}", path, source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Decoding state from {:?}: {}", path, source))]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Encoding state: {}", source))]
    Encode { source: serde_json::Error },

    #[snafu(display("Writing state near {:?}: {}", path, source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Replacing state at {:?}: {}", path, source))]
    Replace {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("State task aborted: {}", source))]
    Join { source: tokio::task::JoinError },
}

/// Persists and retrieves the set of currently in-flight morsels.
///
/// `save` replaces the previously written set in full; a crash mid-save
/// must leave the previous set intact.
#[async_trait]
pub trait StateStore: Send + Sync + Debug + 'static {
    /// The previously saved morsels, or empty if nothing was ever saved.
    async fn load(&self) -> Result<Vec<Morsel>, Error>;

    /// Durably replace the whole morsel set.
    async fn save(&self, morsels: &[Morsel]) -> Result<(), Error>;
}

/// [`StateStore`] backed by a single JSON file, replaced atomically via a
/// temp file in the same directory.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store writing to `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path state is kept at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Vec<Morsel>, Error> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path=?self.path, "no prior state");
                return Ok(vec![]);
            }
            Err(e) => {
                return Err(e).context(ReadSnafu {
                    path: self.path.clone(),
                })
            }
        };

        serde_json::from_slice(&raw).context(DecodeSnafu {
            path: self.path.clone(),
        })
    }

    async fn save(&self, morsels: &[Morsel]) -> Result<(), Error> {
        let raw = serde_json::to_vec_pretty(morsels).context(EncodeSnafu)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir)
                .context(WriteSnafu { path: path.clone() })?;
            std::io::Write::write_all(&mut tmp, &raw)
                .context(WriteSnafu { path: path.clone() })?;
            tmp.persist(&path)
                .context(ReplaceSnafu { path: path.clone() })?;
            Ok(())
        })
        .await
        .context(JoinSnafu)?
    }
}

/// [`StateStore`] held in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    morsels: Mutex<Vec<Morsel>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<Vec<Morsel>, Error> {
        Ok(self.morsels.lock().clone())
    }

    async fn save(&self, morsels: &[Morsel]) -> Result<(), Error> {
        *self.morsels.lock() = morsels.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{Account, ContentId, SpaceId, StoreId, StorePolicy};

    fn morsel(space: &str, marker: Option<&str>) -> Morsel {
        let mut m = Morsel::new(
            Account::new("acme"),
            SpaceId::new(space),
            StorePolicy::new(StoreId::new("0"), StoreId::new("1")),
        );
        m.marker = marker.map(ContentId::new);
        m
    }

    #[tokio::test]
    async fn load_without_prior_state_is_empty() {
        let dir = test_helpers::tmp_dir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_whole_set() {
        let dir = test_helpers::tmp_dir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        store
            .save(&[morsel("photos", Some("img-042")), morsel("docs", None)])
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap().len(), 2);

        store.save(&[morsel("docs", Some("d-1"))]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![morsel("docs", Some("d-1"))]);
    }

    #[tokio::test]
    async fn save_empty_clears_state() {
        let dir = test_helpers::tmp_dir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        store.save(&[morsel("photos", None)]).await.unwrap();
        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error_not_a_reset() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{{{").await.unwrap();

        let store = FileStateStore::new(path);
        assert!(matches!(store.load().await, Err(Error::Decode { .. })));
    }
}
