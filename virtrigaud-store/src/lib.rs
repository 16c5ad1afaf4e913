//! # virtrigaud Store
//!
//! The declarative store contract: typed resources behind a watch/list/update
//! API with optimistic concurrency on a per-object resource version.
//!
//! The orchestration cluster's API server is an external collaborator; this
//! crate defines the interface the reconcilers program against ([`RawStore`]
//! plus the typed [`Api`] handle) and ships [`MemoryStore`], the in-memory
//! implementation used by tests and development mode.

pub mod error;
pub mod event;
pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use virtrigaud_api::{Object, ObjectKey};

pub use error::{Result, StoreError};
pub use event::{Event, EventType, Recorder};
pub use memory::MemoryStore;

/// A change notification: something of `kind` at `key` was written or
/// removed. Consumers reconcile from the store, so the payload is just the
/// key.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: &'static str,
    pub key: ObjectKey,
}

/// Object-safe store contract over raw JSON values.
///
/// Semantics every implementation must honour:
/// - `create` assigns uid, resource version 1 and generation 1.
/// - `update` fails with [`StoreError::Conflict`] unless the incoming
///   resource version matches the stored one; the stored generation is
///   bumped only when the spec changed.
/// - `update_status` replaces only the status subtree.
/// - `delete` marks the object with a deletion timestamp while finalizers
///   remain and removes it once the finalizer list is empty.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn get(&self, kind: &'static str, key: &ObjectKey) -> Result<Option<Value>>;

    async fn list(&self, kind: &'static str, namespace: Option<&str>) -> Result<Vec<Value>>;

    async fn create(&self, kind: &'static str, obj: Value) -> Result<Value>;

    async fn update(&self, kind: &'static str, obj: Value) -> Result<Value>;

    async fn update_status(&self, kind: &'static str, obj: Value) -> Result<Value>;

    async fn delete(&self, kind: &'static str, key: &ObjectKey) -> Result<()>;

    /// Subscribe to change notifications for every kind.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Typed handle over a [`RawStore`] for one resource kind.
pub struct Api<T> {
    raw: Arc<dyn RawStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Api<T>
where
    T: Object + Serialize + DeserializeOwned,
{
    pub fn new(raw: Arc<dyn RawStore>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    fn decode(value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(StoreError::from)
    }

    fn encode(obj: &T) -> Result<Value> {
        serde_json::to_value(obj).map_err(StoreError::from)
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<T>> {
        match self.raw.get(T::KIND, key).await? {
            Some(value) => Ok(Some(Self::decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>> {
        self.raw
            .list(T::KIND, namespace)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// Create the object, returning the stored copy (uid and resource
    /// version assigned).
    pub async fn create(&self, obj: &T) -> Result<T> {
        Self::decode(self.raw.create(T::KIND, Self::encode(obj)?).await?)
    }

    /// Update spec/metadata, returning the stored copy.
    pub async fn update(&self, obj: &T) -> Result<T> {
        Self::decode(self.raw.update(T::KIND, Self::encode(obj)?).await?)
    }

    /// Update only the status subtree, returning the stored copy.
    pub async fn update_status(&self, obj: &T) -> Result<T> {
        Self::decode(self.raw.update_status(T::KIND, Self::encode(obj)?).await?)
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.raw.delete(T::KIND, key).await
    }
}
