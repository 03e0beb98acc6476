//! Provider Adapter Registry
//!
//! A dynamic registry that maps provider identifiers (e.g., "aave-v3") to adapter
//! closures. The orchestrator stays generic: it only knows that an adapter turns
//! `(account, chain)` into a payload or an error.

use super::error::ProviderError;
use super::payload::{ProviderRequest, ProviderResponse};
use crate::aggregation::types::{ChainId, ProviderId, WorkKey};

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ProviderResult = Result<ProviderResponse, ProviderError>;

/// Type alias for a thread-safe, asynchronous provider adapter.
pub type ProviderFn =
    Arc<dyn Fn(ProviderRequest) -> Pin<Box<dyn Future<Output = ProviderResult> + Send>> + Send + Sync>;

struct ProviderEntry {
    adapter: ProviderFn,
    /// Chains the provider serves. Empty means every chain.
    chains: Vec<ChainId>,
}

impl ProviderEntry {
    fn supports(&self, chain: &ChainId) -> bool {
        self.chains.is_empty() || self.chains.contains(chain)
    }
}

/// Registry holding the mapping between provider ids and their adapters.
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an adapter for a provider.
    ///
    /// # Arguments
    /// * `provider` - The provider identifier (case-insensitive).
    /// * `chains` - Chains the provider can answer for; empty for all.
    /// * `adapter` - The closure that performs the provider call.
    pub fn register<F, Fut>(&self, provider: &str, chains: &[&str], adapter: F)
    where
        F: Fn(ProviderRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProviderResult> + Send + 'static,
    {
        let adapter: ProviderFn = Arc::new(move |request: ProviderRequest| {
            Box::pin(adapter(request)) as Pin<Box<dyn Future<Output = ProviderResult> + Send>>
        });

        let provider = ProviderId::new(provider);
        let chains = chains.iter().map(|chain| ChainId::new(chain)).collect();
        tracing::info!("Registered provider adapter: {}", provider);

        self.providers.insert(provider, ProviderEntry { adapter, chains });
    }

    /// Looks up the adapter for the request's provider and runs it.
    ///
    /// An unknown provider is a permanent `NotImplemented` failure.
    pub async fn invoke(&self, request: ProviderRequest) -> ProviderResult {
        let adapter = match self.providers.get(&request.provider) {
            Some(entry) => entry.adapter.clone(),
            None => {
                let error = format!("Unknown provider: {}", request.provider);
                tracing::error!("{}", error);
                return Err(ProviderError::NotImplemented(error));
            }
        };

        tracing::debug!(
            "Invoking provider '{}' for {} on {} (attempt {})",
            request.provider,
            request.account,
            request.chain,
            request.attempt
        );

        adapter(request).await
    }

    /// Expands a request into work items: every selected provider times every chain it serves.
    ///
    /// `providers = None` selects all registered providers. Unknown provider names are
    /// skipped. The result is sorted and free of duplicates.
    pub fn work_items(&self, providers: Option<&[ProviderId]>, chains: &[ChainId]) -> Vec<WorkKey> {
        let selected: Vec<ProviderId> = match providers {
            Some(providers) => providers.to_vec(),
            None => self.list_providers(),
        };

        let mut items: Vec<WorkKey> = selected
            .iter()
            .filter_map(|provider| self.providers.get(provider).map(|entry| (provider, entry)))
            .flat_map(|(provider, entry)| {
                chains
                    .iter()
                    .filter(|chain| entry.supports(chain))
                    .map(|chain| WorkKey {
                        provider: provider.clone(),
                        chain: chain.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        items.sort();
        items.dedup();
        items
    }

    /// Returns all registered provider ids, sorted.
    pub fn list_providers(&self) -> Vec<ProviderId> {
        let mut providers: Vec<ProviderId> =
            self.providers.iter().map(|entry| entry.key().clone()).collect();
        providers.sort();
        providers
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }
}
