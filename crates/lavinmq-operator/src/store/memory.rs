//! In-memory [`ChildStore`] for reconciler tests
//!
//! Mimics the API server behaviour the reconcilers depend on:
//! - a resourceVersion bump on every write
//! - conflict on a stale replace
//! - already-exists on a duplicate create, optionally after another actor
//!   wins the race to create the same object
//!
//! It also counts writes so tests can assert idempotence.

use super::{ChildStore, ManagedResource};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, serde_json::Value>,
    writes: BTreeMap<Key, u32>,
    next_version: u64,
    pending_conflicts: u32,
    racing_creates: BTreeMap<Key, serde_json::Value>,
}

impl Inner {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Shared in-memory object store
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn key<K: ManagedResource>(name: &str) -> Key {
    (K::kind(&()).to_string(), name.to_string())
}

fn encoding_error(e: serde_json::Error) -> OperatorError {
    OperatorError::Internal(format!("memory store encoding: {}", e))
}

fn api_error(code: u16, reason: &str, message: String) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, as if another actor had written it
    pub(crate) fn seed<K: ManagedResource>(&self, obj: &K) {
        let mut inner = self.inner.lock().unwrap();
        let mut obj = obj.clone();
        let version = inner.bump_version();
        obj.meta_mut().resource_version = Some(version);
        obj.meta_mut().generation.get_or_insert(1);
        inner
            .objects
            .insert(key::<K>(&obj.name_any()), serde_json::to_value(&obj).unwrap());
    }

    /// Read an object without going through the trait
    pub(crate) fn fetch<K: ManagedResource>(&self, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Make the next `n` replace calls fail with a conflict, each one
    /// simulating a concurrent writer by bumping the stored version
    pub(crate) fn inject_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().pending_conflicts = n;
    }

    /// Make the next create of `obj`'s name lose a race: `obj` is stored
    /// first, as if another actor created it, and the create fails with
    /// AlreadyExists
    pub(crate) fn race_next_create<K: ManagedResource>(&self, obj: &K) {
        let value = serde_json::to_value(obj).unwrap();
        self.inner
            .lock()
            .unwrap()
            .racing_creates
            .insert(key::<K>(&obj.name_any()), value);
    }

    /// Total successful writes across all objects
    pub(crate) fn write_count(&self) -> u32 {
        self.inner.lock().unwrap().writes.values().sum()
    }

    /// Successful writes to one object
    pub(crate) fn writes_for<K: ManagedResource>(&self, name: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .writes
            .get(&key::<K>(name))
            .copied()
            .unwrap_or(0)
    }

    /// Names of all stored objects of one kind
    pub(crate) fn names<K: ManagedResource>(&self) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        self.inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl ChildStore for MemoryStore {
    async fn get<K: ManagedResource>(&self, name: &str) -> Result<Option<K>> {
        let inner = self.inner.lock().unwrap();
        match inner.objects.get(&key::<K>(name)) {
            Some(value) => Ok(Some(
                serde_json::from_value(value.clone()).map_err(encoding_error)?,
            )),
            None => Ok(None),
        }
    }

    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let name = obj.name_any();
        let k = key::<K>(&name);
        if let Some(mut racer) = inner.racing_creates.remove(&k) {
            let version = inner.bump_version();
            racer["metadata"]["resourceVersion"] = serde_json::Value::String(version);
            racer["metadata"]["generation"] = serde_json::json!(1);
            inner.objects.insert(k.clone(), racer);
        }
        if inner.objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", K::kind(&()), name),
            ));
        }

        let mut stored = obj.clone();
        let version = inner.bump_version();
        stored.meta_mut().resource_version = Some(version);
        stored.meta_mut().generation = Some(1);
        stored.meta_mut().uid = Some(format!("uid-{}", name));
        inner.objects.insert(k.clone(), serde_json::to_value(&stored).map_err(encoding_error)?);
        *inner.writes.entry(k).or_insert(0) += 1;
        Ok(stored)
    }

    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let name = obj.name_any();
        let k = key::<K>(&name);
        let Some(current) = inner.objects.get(&k).cloned() else {
            return Err(api_error(
                404,
                "NotFound",
                format!("{} \"{}\" not found", K::kind(&()), name),
            ));
        };
        let current: K = serde_json::from_value(current).map_err(encoding_error)?;

        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            let mut touched = current.clone();
            let version = inner.bump_version();
            touched.meta_mut().resource_version = Some(version);
            inner.objects.insert(k, serde_json::to_value(&touched).map_err(encoding_error)?);
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }

        if obj.resource_version() != current.resource_version() {
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }

        let mut stored = obj.clone();
        let version = inner.bump_version();
        stored.meta_mut().resource_version = Some(version);
        stored.meta_mut().generation = Some(current.meta().generation.unwrap_or(0) + 1);
        stored.meta_mut().uid = current.meta().uid.clone();
        inner.objects.insert(k.clone(), serde_json::to_value(&stored).map_err(encoding_error)?);
        *inner.writes.entry(k).or_insert(0) += 1;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_replace() {
        let store = MemoryStore::new();

        let created = store.create(&config_map("a")).await.unwrap();
        assert!(created.resource_version().is_some());
        assert!(store.create(&config_map("a")).await.unwrap_err().is_conflict());

        let fetched: ConfigMap = store.get("a").await.unwrap().unwrap();
        let replaced = store.replace(&fetched).await.unwrap();
        assert_ne!(replaced.resource_version(), fetched.resource_version());
        assert_eq!(replaced.metadata.generation, Some(2));

        // Stale write
        assert!(store.replace(&fetched).await.unwrap_err().is_conflict());
        assert_eq!(store.writes_for::<ConfigMap>("a"), 2);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryStore::new();
        let missing: Option<ConfigMap> = store.get("nope").await.unwrap();
        assert!(missing.is_none());
        assert!(store
            .replace(&config_map("nope"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_lost_create_race() {
        let store = MemoryStore::new();
        store.race_next_create(&config_map("a"));

        let err = store.create(&config_map("a")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.fetch::<ConfigMap>("a").is_some());
        assert_eq!(store.write_count(), 0);

        // The race is consumed
        assert!(store.create(&config_map("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let store = MemoryStore::new();
        store.seed(&config_map("a"));
        store.inject_conflicts(1);

        let fetched: ConfigMap = store.get("a").await.unwrap().unwrap();
        assert!(store.replace(&fetched).await.unwrap_err().is_conflict());

        let refetched: ConfigMap = store.get("a").await.unwrap().unwrap();
        assert!(store.replace(&refetched).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }
}
