//! Shared controller context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use virtrigaud_api::provider::Provider;
use virtrigaud_api::Object;
use virtrigaud_provider::{
    ClientFactory, MockProvider, ProviderIdentity, ProviderResolver, ProviderRpc, Result as ProviderResult,
};
use virtrigaud_store::{Api, RawStore, Recorder};
use virtrigaud_storage::StagingFactory;

/// Everything a reconciler needs: the store, the provider client pool, the
/// event recorder and the staging driver factory.
pub struct Ctx {
    pub store: Arc<dyn RawStore>,
    pub resolver: Arc<ProviderResolver>,
    pub recorder: Recorder,
    pub staging: StagingFactory,
}

impl Ctx {
    pub fn new(
        store: Arc<dyn RawStore>,
        resolver: Arc<ProviderResolver>,
        recorder: Recorder,
        staging: StagingFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            recorder,
            staging,
        })
    }

    /// Typed store handle for a kind.
    pub fn api<T>(&self) -> Api<T>
    where
        T: Object + Serialize + DeserializeOwned,
    {
        Api::new(self.store.clone())
    }

    /// Resolve the pooled RPC client for a Provider resource.
    pub async fn client_for(&self, provider: &Provider) -> ProviderResult<Arc<dyn ProviderRpc>> {
        self.resolver
            .resolve(&ProviderIdentity {
                key: provider.key().to_string(),
                provider_type: provider.spec.provider_type,
                endpoint: provider.spec.endpoint.clone(),
            })
            .await
    }
}

/// Factory used in development mode: one in-memory mock worker per
/// provider identity, all sharing the staging mount bases.
pub struct MockClientFactory {
    staging: StagingFactory,
    workers: Mutex<HashMap<String, Arc<MockProvider>>>,
}

impl MockClientFactory {
    pub fn new(staging: StagingFactory) -> Self {
        Self {
            staging,
            workers: Mutex::new(HashMap::new()),
        }
    }
}

impl ClientFactory for MockClientFactory {
    fn build(&self, identity: &ProviderIdentity) -> ProviderResult<Arc<dyn ProviderRpc>> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .entry(identity.key.clone())
            .or_insert_with(|| {
                Arc::new(MockProvider::new().with_staging(self.staging.clone()))
            })
            .clone();
        Ok(worker)
    }
}
