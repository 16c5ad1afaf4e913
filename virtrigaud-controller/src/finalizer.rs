//! Finalizer helpers shared by every reconciler.

use serde::de::DeserializeOwned;
use serde::Serialize;

use virtrigaud_api::Object;
use virtrigaud_store::{Api, Result as StoreResult};

/// Finalizer owned by the VirtualMachine reconciler.
pub const VM_FINALIZER: &str = "virtrigaud.io/vm-protection";

/// Finalizer owned by the VMMigration reconciler.
pub const MIGRATION_FINALIZER: &str = "virtrigaud.io/migration-protection";

/// Finalizer owned by the VMSnapshot reconciler.
pub const SNAPSHOT_FINALIZER: &str = "virtrigaud.io/snapshot-protection";

/// Finalizer owned by the VMClone reconciler.
pub const CLONE_FINALIZER: &str = "virtrigaud.io/clone-protection";

/// Finalizer owned by the VMSet reconciler.
pub const SET_FINALIZER: &str = "virtrigaud.io/set-protection";

/// Finalizer owned by the Provider reconciler.
pub const PROVIDER_FINALIZER: &str = "virtrigaud.io/provider-protection";

/// Add the finalizer if absent. Returns the stored copy when a write
/// happened; the caller should requeue and re-read in that case.
pub async fn ensure<T>(api: &Api<T>, obj: &T, finalizer: &str) -> StoreResult<Option<T>>
where
    T: Object + Clone + Serialize + DeserializeOwned,
{
    if obj.meta().has_finalizer(finalizer) {
        return Ok(None);
    }
    let mut updated = obj.clone();
    updated.meta_mut().add_finalizer(finalizer);
    Ok(Some(api.update(&updated).await?))
}

/// Remove the finalizer, letting the store complete deletion.
pub async fn remove<T>(api: &Api<T>, obj: &T, finalizer: &str) -> StoreResult<()>
where
    T: Object + Clone + Serialize + DeserializeOwned,
{
    if !obj.meta().has_finalizer(finalizer) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.meta_mut().remove_finalizer(finalizer);
    api.update(&updated).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use virtrigaud_api::{VirtualMachine, VirtualMachineSpec};
    use virtrigaud_store::{MemoryStore, RawStore};

    #[tokio::test]
    async fn test_ensure_then_remove() {
        let store: Arc<dyn RawStore> = Arc::new(MemoryStore::new());
        let api: Api<VirtualMachine> = Api::new(store);
        let vm = api
            .create(&VirtualMachine::new("default", "web-01", VirtualMachineSpec::default()))
            .await
            .unwrap();

        let stored = ensure(&api, &vm, VM_FINALIZER).await.unwrap().unwrap();
        assert!(stored.meta.has_finalizer(VM_FINALIZER));

        // Second ensure is a no-op.
        assert!(ensure(&api, &stored, VM_FINALIZER).await.unwrap().is_none());

        remove(&api, &stored, VM_FINALIZER).await.unwrap();
        let fetched = api.get(&vm.key()).await.unwrap().unwrap();
        assert!(!fetched.meta.has_finalizer(VM_FINALIZER));
    }
}
