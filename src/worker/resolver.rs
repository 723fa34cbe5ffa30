use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use moka::future::Cache;

use crate::{abis::IDomainRegistry, chain::RpcChainAdapter};

/// How long a resolved name is served from memory.
const NAME_TTL: Duration = Duration::from_secs(3600);
const NAME_CAPACITY: u64 = 50_000;

/// Looks up the domain label behind a registry token.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// `Ok(None)` means the registry has no name for the token.
    async fn resolve(&self, token_id: U256) -> anyhow::Result<Option<String>>;
}

/// Calls `getDomainByTokenId` on the registry contract through whichever
/// endpoint the adapter currently uses.
pub struct ContractDomainResolver {
    contract: Address,
    adapter: Arc<RpcChainAdapter>,
}

impl ContractDomainResolver {
    pub fn new(contract: Address, adapter: Arc<RpcChainAdapter>) -> Self {
        Self { contract, adapter }
    }
}

#[async_trait]
impl DomainResolver for ContractDomainResolver {
    async fn resolve(&self, token_id: U256) -> anyhow::Result<Option<String>> {
        let registry = IDomainRegistry::new(self.contract, self.adapter.provider());
        let name = registry.getDomainByTokenId(token_id).call().await?;
        Ok(Some(name).filter(|n| !n.is_empty()))
    }
}

/// Keeps successful lookups for an hour. Misses and failures are not cached
/// so a later transfer of the same token retries.
pub struct CachedResolver {
    inner: Arc<dyn DomainResolver>,
    names: Cache<U256, String>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn DomainResolver>) -> Self {
        let names = Cache::builder()
            .max_capacity(NAME_CAPACITY)
            .time_to_live(NAME_TTL)
            .build();
        Self { inner, names }
    }
}

#[async_trait]
impl DomainResolver for CachedResolver {
    async fn resolve(&self, token_id: U256) -> anyhow::Result<Option<String>> {
        if let Some(name) = self.names.get(&token_id).await {
            return Ok(Some(name));
        }

        let resolved = self.inner.resolve(token_id).await?;
        if let Some(name) = &resolved {
            self.names.insert(token_id, name.clone()).await;
        }
        Ok(resolved)
    }
}
