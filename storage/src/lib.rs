//! Uniform contract over object-storage backends, plus the backends the mill
//! ships with (in-memory for tests, local filesystem for single-node
//! deployments). Cloud drivers implement [`StorageProvider`] out of tree.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{Account, ContentId, SpaceId, StoreId};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Debug, Display, Formatter},
    sync::Arc,
};

pub mod local;
pub mod mem;

/// Property key carrying the provider-computed checksum of the content.
///
/// Required on source content for content-level reconciliation.
pub const PROP_CHECKSUM: &str = "content-checksum";

/// Property key carrying the declared mimetype, propagated on copy.
pub const PROP_MIMETYPE: &str = "content-mimetype";

/// Property key carrying the content size in bytes, synthesized by providers.
pub const PROP_SIZE: &str = "content-size";

/// Property key carrying the last-modified instant, synthesized by providers.
pub const PROP_MODIFIED: &str = "content-modified";

/// Generic boxed error type for storage providers.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// driver implementations; the kind is what callers dispatch on.
#[derive(Debug)]
pub struct StorageError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: StorageErrorKind,
}

impl StorageError {
    /// Wrap an arbitrary error with an explicit kind.
    pub fn new(
        kind: StorageErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The requested space or content does not exist.
    pub fn not_found(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StorageErrorKind::NotFound, e)
    }

    /// The target already exists.
    pub fn already_exists(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StorageErrorKind::AlreadyExists, e)
    }

    /// Stored data disagrees with the checksum the caller declared.
    pub fn checksum_mismatch(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StorageErrorKind::ChecksumMismatch, e)
    }

    /// The caller handed the provider something unusable.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StorageErrorKind::InvalidInput, e)
    }

    /// Anything else.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StorageErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for [`StorageErrorKind::NotFound`] checks.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            _ => StorageErrorKind::IO,
        };
        Self {
            inner: Box::new(e),
            kind,
        }
    }
}

impl From<String> for StorageError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: StorageErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for StorageError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: StorageErrorKind::Unknown,
        }
    }
}

/// Classification of a [`StorageError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested space or content does not exist. A domain signal, not
    /// a failure; callers translate it into their case analysis and never
    /// retry it.
    NotFound,

    /// The target already exists. Swallowed by space-ensure paths.
    AlreadyExists,

    /// The caller handed the provider something unusable.
    InvalidInput,

    /// Stored or declared checksums disagree.
    ChecksumMismatch,

    /// Transient I/O failure - the usual retry target.
    IO,

    /// This operation failed for an unknown reason.
    Unknown,
}

/// Key/value properties attached to a content item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentProperties(BTreeMap<String, String>);

impl ContentProperties {
    /// Create an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Remove a property.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// The provider-computed checksum, if present.
    pub fn checksum(&self) -> Option<&str> {
        self.get(PROP_CHECKSUM)
    }

    /// The declared mimetype, if present.
    pub fn mimetype(&self) -> Option<&str> {
        self.get(PROP_MIMETYPE)
    }

    /// Iterate properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no properties are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for ContentProperties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ContentProperties {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

impl IntoIterator for ContentProperties {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A stream of content bytes.
pub type ContentStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// A stream of content ids from a listing.
pub type ContentIdStream<'a> = BoxStream<'a, Result<ContentId, StorageError>>;

/// Page size used by the derived [`StorageProvider::list_space`] stream.
const LIST_PAGE_SIZE: usize = 1000;

/// Uniform operations over an object store.
///
/// All operations may fail transiently; callers wrap them in a retrier.
/// Absence is encoded in return types (`Option`, or a
/// [`StorageErrorKind::NotFound`] kind) rather than being something to retry.
#[async_trait]
pub trait StorageProvider: Send + Sync + Debug + 'static {
    /// True if the space exists.
    async fn space_exists(&self, space_id: &SpaceId) -> Result<bool, StorageError>;

    /// Create a space. A pre-existing space is not an error.
    async fn create_space(&self, space_id: &SpaceId) -> Result<(), StorageError>;

    /// Delete a space and everything in it. Fails `NotFound` when absent.
    async fn delete_space(&self, space_id: &SpaceId) -> Result<(), StorageError>;

    /// Deterministic pagination over the content ids of a space, in
    /// lexicographic order, starting after `marker` (exclusive).
    async fn list_space_chunk(
        &self,
        space_id: &SpaceId,
        marker: Option<&ContentId>,
        limit: usize,
    ) -> Result<Vec<ContentId>, StorageError>;

    /// Lazy listing of a whole space, restartable via `marker`. Derived from
    /// [`Self::list_space_chunk`] page by page.
    fn list_space<'a>(
        &'a self,
        space_id: &'a SpaceId,
        marker: Option<ContentId>,
    ) -> ContentIdStream<'a> {
        futures::stream::try_unfold(
            (marker, Vec::<ContentId>::new().into_iter(), false),
            move |(mut marker, mut page, mut done)| async move {
                loop {
                    if let Some(id) = page.next() {
                        marker = Some(id.clone());
                        return Ok(Some((id, (marker, page, done))));
                    }
                    if done {
                        return Ok(None);
                    }
                    let chunk = self
                        .list_space_chunk(space_id, marker.as_ref(), LIST_PAGE_SIZE)
                        .await?;
                    if chunk.len() < LIST_PAGE_SIZE {
                        done = true;
                    }
                    if chunk.is_empty() {
                        return Ok(None);
                    }
                    page = chunk.into_iter();
                }
            },
        )
        .boxed()
    }

    /// Fetch the properties of a content item, or `None` when it is absent.
    async fn get_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<Option<ContentProperties>, StorageError>;

    /// Replace the caller-owned properties of a content item.
    ///
    /// Storage-synthesized keys (checksum, size) are preserved by the
    /// provider. Fails `NotFound` when the content is absent.
    async fn set_content_properties(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        props: ContentProperties,
    ) -> Result<(), StorageError>;

    /// Stream the bytes of a content item. Fails `NotFound` when absent.
    async fn get_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<ContentStream, StorageError>;

    /// Store a content item and return the checksum the provider computed
    /// for it.
    ///
    /// When `expected_checksum` is given and the stored bytes disagree, the
    /// provider fails `ChecksumMismatch` and does not keep the item.
    #[allow(clippy::too_many_arguments)]
    async fn put_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
        mimetype: &str,
        props: ContentProperties,
        length: u64,
        expected_checksum: Option<&str>,
        stream: ContentStream,
    ) -> Result<String, StorageError>;

    /// Delete a content item. Fails `NotFound` when absent (non-fatal for
    /// most callers).
    async fn delete_content(
        &self,
        space_id: &SpaceId,
        content_id: &ContentId,
    ) -> Result<(), StorageError>;
}

/// Looks up the [`StorageProvider`] serving a given (account, store) pair.
///
/// This is the seam to the credential repository: production deployments
/// build resolvers from credential stores, tests from maps.
pub trait StorageResolver: Send + Sync + Debug + 'static {
    /// Resolve a provider, failing `NotFound` for unknown pairs.
    fn resolve(
        &self,
        account: &Account,
        store_id: &StoreId,
    ) -> Result<Arc<dyn StorageProvider>, StorageError>;
}

/// [`StorageResolver`] over an explicit map of providers.
#[derive(Debug, Default)]
pub struct MapResolver {
    providers: RwLock<HashMap<(Account, StoreId), Arc<dyn StorageProvider>>>,
}

impl MapResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the provider serving `(account, store_id)`.
    pub fn register(
        &self,
        account: Account,
        store_id: StoreId,
        provider: Arc<dyn StorageProvider>,
    ) {
        self.providers
            .write()
            .insert((account, store_id), provider);
    }
}

impl StorageResolver for MapResolver {
    fn resolve(
        &self,
        account: &Account,
        store_id: &StoreId,
    ) -> Result<Arc<dyn StorageProvider>, StorageError> {
        self.providers
            .read()
            .get(&(account.clone(), store_id.clone()))
            .map(Arc::clone)
            .ok_or_else(|| {
                StorageError::not_found(format!(
                    "no provider registered for account {account} store {store_id}"
                ))
            })
    }
}

/// Hex-encoded MD5 digest of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// Lowercase hex encoding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
