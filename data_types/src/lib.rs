//! Shared data types for the duplication mill: tenant/space/content
//! identifiers, replication policies, producer progress morsels and the
//! duplication task itself.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
};

/// Tenant identifier (the account subdomain).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Account(String);

impl Account {
    /// Create a new account id.
    pub fn new(account: impl Into<String>) -> Self {
        Self(account.into())
    }

    /// The account as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical bucket within a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    /// Create a new space id.
    pub fn new(space_id: impl Into<String>) -> Self {
        Self(space_id.into())
    }

    /// The space id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the space id carries no characters.
    ///
    /// An empty space id on a task is a fatal input error; it is kept
    /// representable so the processor can reject it explicitly.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single content item within a space.
///
/// Content ids order lexicographically; listings are returned in that order
/// and the producer's markers rely on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Create a new content id.
    pub fn new(content_id: impl Into<String>) -> Self {
        Self(content_id.into())
    }

    /// The content id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an object-storage backend instance within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Create a new store id.
    pub fn new(store_id: impl Into<String>) -> Self {
        Self(store_id.into())
    }

    /// The store id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single source → destination replication edge.
///
/// A tenant+space may carry several policies with the same source and
/// different destinations (fan-out).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePolicy {
    /// Store content is read from.
    pub src_store: StoreId,
    /// Store content is written to.
    pub dst_store: StoreId,
}

impl StorePolicy {
    /// Create a policy from a source and destination store.
    pub fn new(src_store: StoreId, dst_store: StoreId) -> Self {
        Self {
            src_store,
            dst_store,
        }
    }
}

impl fmt::Display for StorePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src_store, self.dst_store)
    }
}

/// Per-tenant replication configuration: space → set of store policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicy {
    spaces: BTreeMap<SpaceId, BTreeSet<StorePolicy>>,
}

impl TenantPolicy {
    /// Create an empty tenant policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy for a space. Duplicate policies collapse.
    pub fn add(&mut self, space_id: SpaceId, policy: StorePolicy) {
        self.spaces.entry(space_id).or_default().insert(policy);
    }

    /// Iterate spaces and their policies in space order.
    pub fn iter(&self) -> impl Iterator<Item = (&SpaceId, &BTreeSet<StorePolicy>)> {
        self.spaces.iter()
    }

    /// True if no spaces are configured.
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

/// Kind of work carried by a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// One-directional reconciliation from source store to destination store.
    Duplicate,
}

impl TaskKind {
    /// Wire name of the kind, as carried in the queue envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "DUPLICATE",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn try_from_str(s: &str) -> Option<Self> {
        match s {
            "DUPLICATE" => Some(Self::Duplicate),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The identity of a [`Task`]: the tuple that deduplication and equality are
/// defined over. Attempt counts are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskIdentity {
    /// Tenant the task belongs to.
    pub account: Account,
    /// Space being reconciled.
    pub space_id: SpaceId,
    /// Content within the space; `None` denotes a space-level operation.
    pub content_id: Option<ContentId>,
    /// Store content is read from.
    pub src_store: StoreId,
    /// Store content is written to.
    pub dst_store: StoreId,
}

/// A single unit of reconciliation work, serialized onto the task queue.
///
/// Two tasks with equal [`TaskIdentity`] are equal; the attempt count is
/// bookkeeping owned by the workers and does not participate in equality or
/// hashing.
#[derive(Debug, Clone)]
pub struct Task {
    /// What to do. Currently always [`TaskKind::Duplicate`].
    pub kind: TaskKind,
    /// Tenant the task belongs to.
    pub account: Account,
    /// Space being reconciled.
    pub space_id: SpaceId,
    /// Content within the space; `None` denotes a space-level operation.
    pub content_id: Option<ContentId>,
    /// Store content is read from.
    pub src_store: StoreId,
    /// Store content is written to.
    pub dst_store: StoreId,
    /// Number of executions so far, incremented by workers.
    pub attempts: u32,
}

impl Task {
    /// Create a fresh duplication task with zero attempts.
    pub fn duplicate(
        account: Account,
        space_id: SpaceId,
        content_id: Option<ContentId>,
        policy: &StorePolicy,
    ) -> Self {
        Self {
            kind: TaskKind::Duplicate,
            account,
            space_id,
            content_id,
            src_store: policy.src_store.clone(),
            dst_store: policy.dst_store.clone(),
            attempts: 0,
        }
    }

    /// The deduplication identity of this task.
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity {
            account: self.account.clone(),
            space_id: self.space_id.clone(),
            content_id: self.content_id.clone(),
            src_store: self.src_store.clone(),
            dst_store: self.dst_store.clone(),
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.identity() == other.identity()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.identity().hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{} {}->{}",
            self.kind,
            self.account,
            self.space_id,
            self.content_id.as_ref().map(|c| c.as_str()).unwrap_or(""),
            self.src_store,
            self.dst_store,
        )
    }
}

/// Identity of a [`Morsel`]: the key the morsel queue deduplicates on and
/// the key persisted morsels are matched against fresh policy expansion by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MorselIdentity {
    /// Tenant the morsel enumerates for.
    pub account: Account,
    /// Space being enumerated.
    pub space_id: SpaceId,
    /// Replication edge the morsel feeds.
    pub store_policy: StorePolicy,
}

/// The producer's unit of resumable progress over one (account, space,
/// policy) combination.
///
/// The marker is the last content id successfully handed to the queue; a
/// `None` marker means the space scan has not begun and the deletion sweep
/// has not yet run. Markers only ever advance (lexicographically) until the
/// space is exhausted, at which point the morsel is discarded rather than
/// re-persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Morsel {
    /// Tenant the morsel enumerates for.
    pub account: Account,
    /// Space being enumerated.
    pub space_id: SpaceId,
    /// Exclusive lower bound for the next listing page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<ContentId>,
    /// Replication edge the morsel feeds.
    pub store_policy: StorePolicy,
}

impl Morsel {
    /// Create a fresh morsel with no progress.
    pub fn new(account: Account, space_id: SpaceId, store_policy: StorePolicy) -> Self {
        Self {
            account,
            space_id,
            marker: None,
            store_policy,
        }
    }

    /// The identity of this morsel, independent of its marker.
    pub fn identity(&self) -> MorselIdentity {
        MorselIdentity {
            account: self.account.clone(),
            space_id: self.space_id.clone(),
            store_policy: self.store_policy.clone(),
        }
    }
}

impl fmt::Display for Morsel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} @{}",
            self.account,
            self.space_id,
            self.store_policy,
            self.marker.as_ref().map(|m| m.as_str()).unwrap_or("-"),
        )
    }
}
