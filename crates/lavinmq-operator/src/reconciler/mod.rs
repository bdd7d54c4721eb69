//! Convergence of the child objects owned by a LavinMQ resource
//!
//! Four reconcilers each own one kind of child object. A pass runs them
//! in a fixed order (config, headless service, volume claims,
//! statefulset) because the statefulset reads back the rendered config to
//! fingerprint it. Each reconciler follows the same shape:
//!
//! 1. build the desired object
//! 2. fetch the existing one by name
//! 3. create it when missing
//! 4. otherwise copy only the differing fields onto the existing object and
//!    replace it, skipping the write when nothing differs
//!
//! Steps 2-4 run inside [`retry_on_conflict`] so a concurrent write
//! restarts them from a fresh read.

mod config_map;
mod headless_service;
mod stateful_set;
mod volume_claim;

pub use config_map::ConfigMapReconciler;
pub use headless_service::HeadlessServiceReconciler;
pub use stateful_set::StatefulSetReconciler;
pub use volume_claim::VolumeClaimReconciler;

use crate::crd::LavinMQ;
use crate::error::{OperatorError, Result};
use crate::resources::ResourceBuilder;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{ChildStore, ManagedResource};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// What a reconciler wants to happen after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Converged; wait for the next trigger
    Done,
    /// Look again after the given delay
    After(Duration),
}

impl Requeue {
    /// Combine two hints, keeping the earliest requested recheck
    pub fn merge(self, other: Requeue) -> Requeue {
        match (self, other) {
            (Requeue::Done, r) | (r, Requeue::Done) => r,
            (Requeue::After(a), Requeue::After(b)) => Requeue::After(a.min(b)),
        }
    }
}

/// A convergence routine for one kind of child object
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the child object toward the desired state
    async fn reconcile(&self) -> Result<Requeue>;

    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;
}

/// State shared by the reconcilers of one pass
pub struct ReconcileContext<S> {
    instance: Arc<LavinMQ>,
    store: S,
    retry: RetryConfig,
    name: String,
    namespace: String,
}

impl<S: ChildStore> ReconcileContext<S> {
    /// Create a context for one pass over `instance`
    pub fn new(instance: Arc<LavinMQ>, store: S, retry: RetryConfig) -> Result<Self> {
        let name = instance.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig("instance name is required".to_string())
        })?;
        let namespace = instance.namespace().unwrap_or_else(|| "default".to_string());

        Ok(Self {
            instance,
            store,
            retry,
            name,
            namespace,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Builder for the desired child objects
    pub fn builder(&self) -> Result<ResourceBuilder<'_>> {
        ResourceBuilder::new(&self.instance)
    }

    /// The reconcilers of a pass, in execution order
    pub fn reconcilers(&self) -> Vec<Box<dyn Reconciler + '_>> {
        vec![
            Box::new(ConfigMapReconciler::new(self)),
            Box::new(HeadlessServiceReconciler::new(self)),
            Box::new(VolumeClaimReconciler::new(self)),
            Box::new(StatefulSetReconciler::new(self)),
        ]
    }
}

/// Result of converging one child object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Created,
    Updated,
    Unchanged,
}

/// Fetch, then create or diff-and-replace one child object.
///
/// `diff` copies the fields it owns from the desired object onto the
/// existing one and reports whether anything changed. An error from `diff`
/// leaves the stored object untouched.
pub(crate) async fn converge<S, K, F>(
    ctx: &ReconcileContext<S>,
    desired: &K,
    diff: F,
) -> Result<Outcome>
where
    S: ChildStore,
    K: ManagedResource,
    F: Fn(&mut K, &K) -> Result<bool> + Sync,
{
    let name = desired.name_any();
    let kind = K::kind(&());
    let operation = format!("{}/{}", kind, name);

    let name = name.as_str();
    let diff = &diff;
    let outcome = retry_on_conflict(&ctx.retry, &operation, move || async move {
        let existing: Option<K> = ctx.store.get(name).await?;
        match existing {
            None => {
                ctx.store.create(desired).await?;
                Ok(Outcome::Created)
            }
            Some(mut existing) => {
                if diff(&mut existing, desired)? {
                    ctx.store.replace(&existing).await?;
                    Ok(Outcome::Updated)
                } else {
                    Ok(Outcome::Unchanged)
                }
            }
        }
    })
    .await?;

    match outcome {
        Outcome::Created => info!(kind = %kind, name = %name, "Created child object"),
        Outcome::Updated => info!(kind = %kind, name = %name, "Updated child object"),
        Outcome::Unchanged => debug!(kind = %kind, name = %name, "Child object up to date"),
    }

    Ok(outcome)
}

/// Run one reconcile pass: every reconciler in order, stopping at the
/// first error, which is returned unmodified.
#[instrument(skip(ctx), fields(name = %ctx.name(), namespace = %ctx.namespace()))]
pub async fn reconcile_all<S: ChildStore>(ctx: &ReconcileContext<S>) -> Result<Requeue> {
    let mut requeue = Requeue::Done;

    for reconciler in ctx.reconcilers() {
        let span = info_span!("reconciler", reconciler = reconciler.name());
        match reconciler.reconcile().instrument(span).await {
            Ok(next) => requeue = requeue.merge(next),
            Err(e) => {
                warn!(
                    reconciler = reconciler.name(),
                    error = %e,
                    "Reconciler failed, aborting pass"
                );
                return Err(e);
            }
        }
    }

    Ok(requeue)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::crd::LavinMQSpec;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn instance(name: &str) -> LavinMQ {
        LavinMQ {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{}-uid", name)),
                generation: Some(1),
                ..Default::default()
            },
            spec: LavinMQSpec::default(),
            status: None,
        }
    }

    pub(crate) fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    pub(crate) fn context(instance: LavinMQ, store: &MemoryStore) -> ReconcileContext<MemoryStore> {
        ReconcileContext::new(Arc::new(instance), store.clone(), fast_retry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{context, instance};
    use super::*;
    use crate::config::{config_fingerprint, render_config};
    use crate::resources::CONFIG_HASH_ANNOTATION;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
    use std::collections::BTreeMap;

    fn config_hash(store: &MemoryStore, name: &str) -> String {
        let sts: StatefulSet = store.fetch(name).unwrap();
        sts.spec.unwrap().template.metadata.unwrap().annotations.unwrap()[CONFIG_HASH_ANNOTATION]
            .clone()
    }

    #[test]
    fn test_requeue_merge() {
        let short = Requeue::After(Duration::from_secs(5));
        let long = Requeue::After(Duration::from_secs(60));

        assert_eq!(Requeue::Done.merge(Requeue::Done), Requeue::Done);
        assert_eq!(Requeue::Done.merge(long), long);
        assert_eq!(short.merge(Requeue::Done), short);
        assert_eq!(long.merge(short), short);
    }

    #[test]
    fn test_reconciler_order() {
        let store = MemoryStore::new();
        let ctx = context(instance("broker"), &store);
        let names: Vec<_> = ctx.reconcilers().iter().map(|r| r.name()).collect();

        assert_eq!(
            names,
            vec!["config", "headless-service", "volume-claims", "statefulset"]
        );
    }

    #[tokio::test]
    async fn test_first_pass_creates_all_children() {
        let store = MemoryStore::new();
        let mut lmq = instance("broker");
        lmq.spec.replicas = 3;
        lmq.spec.etcd_endpoints = vec!["etcd:2379".to_string()];
        let ctx = context(lmq, &store);

        reconcile_all(&ctx).await.unwrap();

        assert!(store.fetch::<ConfigMap>("broker").is_some());
        assert!(store.fetch::<Service>("broker").is_some());
        assert_eq!(
            store.names::<PersistentVolumeClaim>(),
            vec!["data-broker-0", "data-broker-1", "data-broker-2"]
        );

        let sts: StatefulSet = store.fetch("broker").unwrap();
        let owner = &sts.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.uid, "broker-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let store = MemoryStore::new();
        let mut lmq = instance("broker");
        lmq.spec.etcd_endpoints = vec!["etcd:2379".to_string()];
        let ctx = context(lmq, &store);

        reconcile_all(&ctx).await.unwrap();
        let writes = store.write_count();
        let sts_before: StatefulSet = store.fetch("broker").unwrap();

        let requeue = reconcile_all(&ctx).await.unwrap();
        let sts_after: StatefulSet = store.fetch("broker").unwrap();

        assert_eq!(store.write_count(), writes);
        assert_eq!(requeue, Requeue::Done);
        assert_eq!(sts_before.metadata.generation, sts_after.metadata.generation);
        assert_eq!(
            sts_before.metadata.resource_version,
            sts_after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_config_change_changes_fingerprint() {
        let store = MemoryStore::new();
        let first = instance("broker");
        reconcile_all(&context(first.clone(), &store)).await.unwrap();
        let hash_one = config_hash(&store, "broker");
        assert_eq!(hash_one, config_fingerprint(&render_config(&first).unwrap()));

        // Same render, same fingerprint
        reconcile_all(&context(first.clone(), &store)).await.unwrap();
        assert_eq!(config_hash(&store, "broker"), hash_one);

        let mut second = first.clone();
        second.spec.config.amqp.port = 1111;
        reconcile_all(&context(second, &store)).await.unwrap();
        let hash_two = config_hash(&store, "broker");

        assert_ne!(hash_one, hash_two);
        assert_eq!(store.writes_for::<StatefulSet>("broker"), 2);
    }

    #[tokio::test]
    async fn test_error_aborts_remaining_reconcilers() {
        let store = MemoryStore::new();
        let mut lmq = instance("broker");
        lmq.spec.data_volume_claim.size = "20Gi".to_string();
        reconcile_all(&context(lmq.clone(), &store)).await.unwrap();
        let sts_writes = store.writes_for::<StatefulSet>("broker");

        // Shrinking storage fails before the statefulset sees the new image
        lmq.spec.data_volume_claim.size = "10Gi".to_string();
        lmq.spec.image = "cloudamqp/lavinmq:2.3.0".to_string();
        let err = reconcile_all(&context(lmq, &store)).await.unwrap_err();

        assert!(matches!(err, OperatorError::StorageShrink { .. }));
        assert_eq!(store.writes_for::<StatefulSet>("broker"), sts_writes);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = MemoryStore::new();
        let first = instance("broker");
        reconcile_all(&context(first.clone(), &store)).await.unwrap();

        let mut second = first;
        second.spec.config.main.log_level = "debug".to_string();
        store.inject_conflicts(2);
        reconcile_all(&context(second, &store)).await.unwrap();

        let cm: ConfigMap = store.fetch("broker").unwrap();
        assert!(cm.data.unwrap()["lavinmq.ini"].contains("log_level = debug"));
    }

    #[tokio::test]
    async fn test_create_race_takes_update_path() {
        let store = MemoryStore::new();
        let ctx = context(instance("broker"), &store);
        let desired = ctx.builder().unwrap().build_configmap().unwrap();

        let mut stale = desired.clone();
        stale.data = Some(BTreeMap::from([(
            "lavinmq.ini".to_string(),
            "[main]\n".to_string(),
        )]));
        store.race_next_create(&stale);

        let outcome = converge(&ctx, &desired, |existing, desired| {
            Ok(super::config_map::diff_config_map(existing, desired))
        })
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Updated);
        let cm: ConfigMap = store.fetch("broker").unwrap();
        assert_eq!(cm.data, desired.data);
        assert_eq!(store.writes_for::<ConfigMap>("broker"), 1);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let store = MemoryStore::new();
        let first = instance("broker");
        reconcile_all(&context(first.clone(), &store)).await.unwrap();

        let mut second = first;
        second.spec.config.main.log_level = "debug".to_string();
        store.inject_conflicts(10);
        let err = reconcile_all(&context(second, &store)).await.unwrap_err();

        assert!(err.is_conflict());
    }
}
