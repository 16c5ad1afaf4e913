//! In-memory store used by tests and development mode.
//!
//! Implements the full store contract: optimistic concurrency on resource
//! versions, generation bumps on spec change, and two-phase deletion gated
//! on finalizers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use virtrigaud_api::{ObjectKey, ObjectMeta};

use crate::error::{Result, StoreError};
use crate::{RawStore, StoreEvent};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store keyed by (kind, namespace/name).
pub struct MemoryStore {
    objects: RwLock<HashMap<&'static str, HashMap<ObjectKey, Value>>>,
    watch_tx: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            watch_tx,
        }
    }

    fn notify(&self, kind: &'static str, key: &ObjectKey) {
        // No receivers is fine; the send result only reports that.
        let _ = self.watch_tx.send(StoreEvent {
            kind,
            key: key.clone(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn meta_of(kind: &'static str, obj: &Value) -> Result<ObjectMeta> {
    let meta = obj
        .get("meta")
        .cloned()
        .ok_or_else(|| StoreError::Internal(format!("{kind} object has no meta")))?;
    Ok(serde_json::from_value(meta)?)
}

fn put_meta(obj: &mut Value, meta: &ObjectMeta) -> Result<()> {
    obj["meta"] = serde_json::to_value(meta)?;
    Ok(())
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn get(&self, kind: &'static str, key: &ObjectKey) -> Result<Option<Value>> {
        let objects = self.objects.read().await;
        Ok(objects.get(kind).and_then(|m| m.get(key)).cloned())
    }

    async fn list(&self, kind: &'static str, namespace: Option<&str>) -> Result<Vec<Value>> {
        let objects = self.objects.read().await;
        let mut out: Vec<(ObjectKey, Value)> = objects
            .get(kind)
            .map(|m| {
                m.iter()
                    .filter(|(key, _)| namespace.map(|ns| key.namespace == ns).unwrap_or(true))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }

    async fn create(&self, kind: &'static str, mut obj: Value) -> Result<Value> {
        let mut meta = meta_of(kind, &obj)?;
        let key = meta.key();

        let mut objects = self.objects.write().await;
        let by_key = objects.entry(kind).or_default();
        if by_key.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind, key });
        }

        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = 1;
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        put_meta(&mut obj, &meta)?;

        by_key.insert(key.clone(), obj.clone());
        drop(objects);

        debug!(kind, key = %key, "object created");
        self.notify(kind, &key);
        Ok(obj)
    }

    async fn update(&self, kind: &'static str, mut obj: Value) -> Result<Value> {
        let mut meta = meta_of(kind, &obj)?;
        let key = meta.key();

        let mut objects = self.objects.write().await;
        let by_key = objects.entry(kind).or_default();
        let stored = by_key
            .get(&key)
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })?
            .clone();
        let stored_meta = meta_of(kind, &stored)?;

        if meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict { kind, key });
        }

        // Identity and deletion state are store-owned.
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = stored_meta.resource_version + 1;
        meta.generation = if obj.get("spec") != stored.get("spec") {
            stored_meta.generation + 1
        } else {
            stored_meta.generation
        };

        // Status is written through update_status only.
        if let Some(status) = stored.get("status") {
            obj["status"] = status.clone();
        }
        put_meta(&mut obj, &meta)?;

        if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
            by_key.remove(&key);
            drop(objects);
            debug!(kind, key = %key, "finalizers cleared, object removed");
            self.notify(kind, &key);
            return Ok(obj);
        }

        by_key.insert(key.clone(), obj.clone());
        drop(objects);
        self.notify(kind, &key);
        Ok(obj)
    }

    async fn update_status(&self, kind: &'static str, obj: Value) -> Result<Value> {
        let meta = meta_of(kind, &obj)?;
        let key = meta.key();

        let mut objects = self.objects.write().await;
        let by_key = objects.entry(kind).or_default();
        let stored = by_key
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })?;
        let mut stored_meta = meta_of(kind, stored)?;

        if meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict { kind, key });
        }

        stored_meta.resource_version += 1;
        stored["status"] = obj.get("status").cloned().unwrap_or(Value::Null);
        put_meta(stored, &stored_meta)?;

        let out = stored.clone();
        drop(objects);
        self.notify(kind, &key);
        Ok(out)
    }

    async fn delete(&self, kind: &'static str, key: &ObjectKey) -> Result<()> {
        let mut objects = self.objects.write().await;
        let by_key = objects.entry(kind).or_default();
        let stored = by_key.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind,
            key: key.clone(),
        })?;
        let mut meta = meta_of(kind, stored)?;

        if meta.finalizers.is_empty() {
            by_key.remove(key);
            drop(objects);
            debug!(kind, key = %key, "object removed");
            self.notify(kind, key);
            return Ok(());
        }

        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version += 1;
            put_meta(stored, &meta)?;
            drop(objects);
            debug!(kind, key = %key, "deletion requested, awaiting finalizers");
            self.notify(kind, key);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.watch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Api;
    use std::sync::Arc;
    use virtrigaud_api::{Object, VirtualMachine, VirtualMachineSpec};

    fn api(store: &Arc<MemoryStore>) -> Api<VirtualMachine> {
        Api::new(store.clone() as Arc<dyn RawStore>)
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = Arc::new(MemoryStore::new());
        let vm = VirtualMachine::new("default", "web-01", VirtualMachineSpec::default());
        let stored = api(&store).create(&vm).await.unwrap();
        assert!(!stored.meta.uid.is_empty());
        assert_eq!(stored.meta.resource_version, 1);
        assert_eq!(stored.meta.generation, 1);
    }

    #[tokio::test]
    async fn test_update_conflict_on_stale_version() {
        let store = Arc::new(MemoryStore::new());
        let api = api(&store);
        let vm = VirtualMachine::new("default", "web-01", VirtualMachineSpec::default());
        let stored = api.create(&vm).await.unwrap();

        let mut first = stored.clone();
        first.spec.tags.push("a".into());
        api.update(&first).await.unwrap();

        let mut stale = stored;
        stale.spec.tags.push("b".into());
        let err = api.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_generation_bumps_only_on_spec_change() {
        let store = Arc::new(MemoryStore::new());
        let api = api(&store);
        let vm = VirtualMachine::new("default", "web-01", VirtualMachineSpec::default());
        let stored = api.create(&vm).await.unwrap();

        let mut status_only = stored.clone();
        status_only.status.ips.push("10.0.0.5".into());
        let written = api.update_status(&status_only).await.unwrap();
        assert_eq!(written.meta.generation, 1);
        assert_eq!(written.status.ips, vec!["10.0.0.5".to_string()]);

        let mut spec_change = written.clone();
        spec_change.spec.tags.push("web".into());
        let written = api.update(&spec_change).await.unwrap();
        assert_eq!(written.meta.generation, 2);
        // update() leaves status alone
        assert_eq!(written.status.ips, vec!["10.0.0.5".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_blocks_on_finalizers() {
        let store = Arc::new(MemoryStore::new());
        let api = api(&store);
        let mut vm = VirtualMachine::new("default", "web-01", VirtualMachineSpec::default());
        vm.meta.add_finalizer("virtrigaud.io/vm-protection");
        let stored = api.create(&vm).await.unwrap();
        let key = stored.key();

        api.delete(&key).await.unwrap();
        let fetched = api.get(&key).await.unwrap().unwrap();
        assert!(fetched.meta.deletion_timestamp.is_some());

        let mut finalized = fetched;
        finalized.meta.remove_finalizer("virtrigaud.io/vm-protection");
        api.update(&finalized).await.unwrap();
        assert!(api.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_emits_on_writes() {
        let store = Arc::new(MemoryStore::new());
        let mut rx = store.watch();
        let api = api(&store);
        let vm = VirtualMachine::new("default", "web-01", VirtualMachineSpec::default());
        api.create(&vm).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, VirtualMachine::KIND);
        assert_eq!(event.key, vm.key());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let store = Arc::new(MemoryStore::new());
        let api = api(&store);
        api.create(&VirtualMachine::new("a", "vm-1", VirtualMachineSpec::default()))
            .await
            .unwrap();
        api.create(&VirtualMachine::new("b", "vm-2", VirtualMachineSpec::default()))
            .await
            .unwrap();

        assert_eq!(api.list(None).await.unwrap().len(), 2);
        assert_eq!(api.list(Some("a")).await.unwrap().len(), 1);
    }
}
