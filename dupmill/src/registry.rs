//! Loading of the credentials file and the replication policy snapshot.
//!
//! Both are JSON files owned by the deployment. The credentials file maps
//! (account, store id) to a provider spec; the policy file maps account and
//! space to source/destination store pairs.

use data_types::{Account, SpaceId, StoreId, StorePolicy, TenantPolicy};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use storage::{local::LocalStorage, MapResolver, StorageProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Opening store {store_id} for account {account}: {source}")]
    OpenStore {
        account: Account,
        store_id: StoreId,
        source: storage::StorageError,
    },
}

#[derive(Debug, serde::Deserialize)]
struct CredentialsFile {
    accounts: BTreeMap<String, AccountCredentials>,
}

#[derive(Debug, serde::Deserialize)]
struct AccountCredentials {
    stores: BTreeMap<String, StoreSpec>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StoreSpec {
    /// A local-filesystem store rooted at a directory.
    Local { root: std::path::PathBuf },
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let raw = tokio::fs::read(path).await.map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| Error::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Build the storage resolver described by the credentials file.
pub async fn resolver_from_credentials(path: &Path) -> Result<Arc<MapResolver>, Error> {
    let credentials: CredentialsFile = read_json(path).await?;

    let resolver = Arc::new(MapResolver::new());
    for (account, account_credentials) in credentials.accounts {
        let account = Account::new(account);
        for (store_id, spec) in account_credentials.stores {
            let store_id = StoreId::new(store_id);
            let provider: Arc<dyn StorageProvider> = match spec {
                StoreSpec::Local { root } => Arc::new(
                    LocalStorage::new(root)
                        .await
                        .map_err(|source| Error::OpenStore {
                            account: account.clone(),
                            store_id: store_id.clone(),
                            source,
                        })?,
                ),
            };
            resolver.register(account.clone(), store_id, provider);
        }
    }
    Ok(resolver)
}

#[derive(Debug, serde::Deserialize)]
struct PolicyEdge {
    src: String,
    dst: String,
}

/// Load the current replication policy snapshot:
/// account -> space -> [(src store, dst store)].
pub async fn load_policies(path: &Path) -> Result<BTreeMap<Account, TenantPolicy>, Error> {
    let raw: BTreeMap<String, BTreeMap<String, Vec<PolicyEdge>>> = read_json(path).await?;

    let mut policies = BTreeMap::new();
    for (account, spaces) in raw {
        let mut tenant = TenantPolicy::new();
        for (space, edges) in spaces {
            for edge in edges {
                tenant.add(
                    SpaceId::new(space.clone()),
                    StorePolicy::new(StoreId::new(edge.src), StoreId::new(edge.dst)),
                );
            }
        }
        policies.insert(Account::new(account), tenant);
    }
    Ok(policies)
}
