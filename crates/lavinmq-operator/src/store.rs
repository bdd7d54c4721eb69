//! Access to the child objects owned by a LavinMQ resource
//!
//! Reconcilers only need three calls against the API server: read by name,
//! create and replace. [`ChildStore`] captures exactly that so the
//! reconcilers can run against [`KubeStore`] in the cluster and against an
//! in-memory store in tests.

use crate::error::Result;
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

#[cfg(test)]
pub(crate) mod memory;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "lavinmq-operator";

/// Namespaced Kubernetes object the operator creates and owns
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> ManagedResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Read and write child objects in one namespace
#[async_trait]
pub trait ChildStore: Send + Sync {
    /// Fetch an object by name. A missing object is `Ok(None)`.
    async fn get<K: ManagedResource>(&self, name: &str) -> Result<Option<K>>;

    /// Create a new object
    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K>;

    /// Replace an existing object. The write carries the resourceVersion the
    /// object was read at, so a concurrent change fails with a conflict.
    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K>;
}

/// [`ChildStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K: ManagedResource>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

#[async_trait]
impl ChildStore for KubeStore {
    async fn get<K: ManagedResource>(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>().get_opt(name).await?)
    }

    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        debug!(kind = %K::kind(&()), name = %obj.name_any(), "Creating object");
        Ok(self.api::<K>().create(&Self::post_params(), obj).await?)
    }

    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!(
            kind = %K::kind(&()),
            name = %name,
            resource_version = ?obj.resource_version(),
            "Replacing object"
        );
        Ok(self
            .api::<K>()
            .replace(&name, &Self::post_params(), obj)
            .await?)
    }
}
