//! Provider resolver: a pool of RPC clients keyed by provider identity.
//!
//! The resolver creates clients lazily, reuses them while the endpoint is
//! unchanged, and evicts clients that fail validation past the unhealthy
//! threshold.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use virtrigaud_api::provider::ProviderType;

use crate::client::ProviderRpc;
use crate::error::{ProviderError, Result};
use crate::http::HttpProviderClient;

/// Identity of one provider worker deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderIdentity {
    /// `namespace/name` of the Provider resource.
    pub key: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
}

/// Builds an RPC client for a provider identity.
pub trait ClientFactory: Send + Sync {
    fn build(&self, identity: &ProviderIdentity) -> Result<Arc<dyn ProviderRpc>>;
}

/// Production factory: Connect-style HTTP clients.
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn build(&self, identity: &ProviderIdentity) -> Result<Arc<dyn ProviderRpc>> {
        if identity.endpoint.is_empty() {
            return Err(ProviderError::InvalidSpec(format!(
                "provider {} has no endpoint",
                identity.key
            )));
        }
        Ok(Arc::new(HttpProviderClient::new(identity.endpoint.clone())?))
    }
}

/// Fixed client map, used by tests and development mode.
#[derive(Default)]
pub struct StaticClientFactory {
    clients: HashMap<String, Arc<dyn ProviderRpc>>,
}

impl StaticClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, client: Arc<dyn ProviderRpc>) {
        self.clients.insert(key.into(), client);
    }

    pub fn with_client(mut self, key: impl Into<String>, client: Arc<dyn ProviderRpc>) -> Self {
        self.insert(key, client);
        self
    }
}

impl ClientFactory for StaticClientFactory {
    fn build(&self, identity: &ProviderIdentity) -> Result<Arc<dyn ProviderRpc>> {
        self.clients
            .get(&identity.key)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(format!("no client for {}", identity.key)))
    }
}

struct Pooled {
    client: Arc<dyn ProviderRpc>,
    endpoint: String,
    consecutive_failures: u32,
}

/// Default failures before a pooled client is evicted.
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Pool of provider clients keyed by provider identity.
pub struct ProviderResolver {
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, Pooled>>,
    unhealthy_threshold: u32,
}

impl ProviderResolver {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }

    /// Resolve a client for the identity, creating one if missing or if the
    /// endpoint changed.
    pub async fn resolve(&self, identity: &ProviderIdentity) -> Result<Arc<dyn ProviderRpc>> {
        {
            let clients = self.clients.read().await;
            if let Some(pooled) = clients.get(&identity.key) {
                if pooled.endpoint == identity.endpoint {
                    return Ok(pooled.client.clone());
                }
            }
        }

        let client = self.factory.build(identity)?;
        let mut clients = self.clients.write().await;
        // Another task may have won the race; prefer the existing client
        // so the pool stays one-per-identity.
        if let Some(pooled) = clients.get(&identity.key) {
            if pooled.endpoint == identity.endpoint {
                return Ok(pooled.client.clone());
            }
        }
        debug!(provider = %identity.key, endpoint = %identity.endpoint, "provider client created");
        clients.insert(
            identity.key.clone(),
            Pooled {
                client: client.clone(),
                endpoint: identity.endpoint.clone(),
                consecutive_failures: 0,
            },
        );
        Ok(client)
    }

    /// Drop a pooled client; the next resolve re-creates it.
    pub async fn evict(&self, key: &str) {
        if self.clients.write().await.remove(key).is_some() {
            info!(provider = %key, "provider client evicted");
        }
    }

    /// Validate every pooled client, evicting those past the unhealthy
    /// threshold. Returns the providers that failed this round.
    pub async fn validate_all(&self) -> Vec<(String, ProviderError)> {
        let snapshot: Vec<(String, Arc<dyn ProviderRpc>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .map(|(k, p)| (k.clone(), p.client.clone()))
                .collect()
        };

        let mut failures = Vec::new();
        for (key, client) in snapshot {
            match client.validate().await {
                Ok(()) => {
                    let mut clients = self.clients.write().await;
                    if let Some(pooled) = clients.get_mut(&key) {
                        pooled.consecutive_failures = 0;
                    }
                }
                Err(e) => {
                    warn!(provider = %key, error = %e, "provider validation failed");
                    let mut clients = self.clients.write().await;
                    if let Some(pooled) = clients.get_mut(&key) {
                        pooled.consecutive_failures += 1;
                        if pooled.consecutive_failures >= self.unhealthy_threshold {
                            clients.remove(&key);
                            info!(provider = %key, "unhealthy provider client evicted");
                        }
                    }
                    failures.push((key, e));
                }
            }
        }
        failures
    }

    pub async fn pooled_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn identity(key: &str) -> ProviderIdentity {
        ProviderIdentity {
            key: key.to_string(),
            provider_type: ProviderType::Mock,
            endpoint: format!("http://{key}:9090"),
        }
    }

    #[tokio::test]
    async fn test_resolve_pools_per_identity() {
        let mock = Arc::new(MockProvider::new());
        let factory = StaticClientFactory::new().with_client("default/lv1", mock.clone());
        let resolver = ProviderResolver::new(Arc::new(factory));

        let a = resolver.resolve(&identity("default/lv1")).await.unwrap();
        let b = resolver.resolve(&identity("default/lv1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.pooled_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_unavailable() {
        let resolver = ProviderResolver::new(Arc::new(StaticClientFactory::new()));
        let err = resolver.resolve(&identity("default/missing")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_validate_all_evicts_after_threshold() {
        let mock = Arc::new(MockProvider::new());
        let factory = StaticClientFactory::new().with_client("default/lv1", mock.clone());
        let resolver = ProviderResolver::new(Arc::new(factory));
        resolver.resolve(&identity("default/lv1")).await.unwrap();

        mock.set_available(false);
        for _ in 0..DEFAULT_UNHEALTHY_THRESHOLD {
            let failures = resolver.validate_all().await;
            assert_eq!(failures.len(), 1);
        }
        assert_eq!(resolver.pooled_count().await, 0);

        // The next resolve re-creates the client.
        mock.set_available(true);
        resolver.resolve(&identity("default/lv1")).await.unwrap();
        assert_eq!(resolver.pooled_count().await, 1);
    }

    #[tokio::test]
    async fn test_endpoint_change_replaces_client() {
        let mock = Arc::new(MockProvider::new());
        let factory = StaticClientFactory::new().with_client("default/lv1", mock.clone());
        let resolver = ProviderResolver::new(Arc::new(factory));

        resolver.resolve(&identity("default/lv1")).await.unwrap();
        let mut moved = identity("default/lv1");
        moved.endpoint = "http://new-endpoint:9090".into();
        resolver.resolve(&moved).await.unwrap();
        assert_eq!(resolver.pooled_count().await, 1);
    }
}
