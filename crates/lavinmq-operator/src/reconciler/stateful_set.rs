//! Workload reconciler
//!
//! Runs last in a pass. It fingerprints the rendered config stored in the
//! ConfigMap and writes the digest into the pod template, so any config
//! change rolls the pods.

use super::{converge, Outcome, ReconcileContext, Reconciler, Requeue};
use crate::config::{config_fingerprint, CONFIG_FILE_NAME};
use crate::error::{OperatorError, Result};
use crate::quantity::resources_equal;
use crate::resources::{CONFIG_HASH_ANNOTATION, CONTAINER_NAME, TLS_VOLUME};
use crate::store::ChildStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Container, ContainerPort, PodSpec, Volume, VolumeMount};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// Recheck interval while a rollout triggered by this pass is in progress
const ROLLOUT_REQUEUE: Duration = Duration::from_secs(10);

/// Keeps the broker StatefulSet in line with the spec and the config
pub struct StatefulSetReconciler<'a, S> {
    ctx: &'a ReconcileContext<S>,
}

impl<'a, S: ChildStore> StatefulSetReconciler<'a, S> {
    pub fn new(ctx: &'a ReconcileContext<S>) -> Self {
        Self { ctx }
    }

    /// Fingerprint of the stored config document
    async fn config_hash(&self) -> Result<String> {
        let name = self.ctx.name();
        let missing = |reason: String| OperatorError::DependencyMissing {
            kind: "ConfigMap".to_string(),
            name: name.to_string(),
            reason,
        };

        let config_map: Option<ConfigMap> = self.ctx.store().get(name).await?;
        let config_map = config_map.ok_or_else(|| missing("not found".to_string()))?;
        let document = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(CONFIG_FILE_NAME))
            .ok_or_else(|| missing(format!("key {} not found", CONFIG_FILE_NAME)))?;

        Ok(config_fingerprint(document))
    }
}

type PortKey = (String, i32, String);

fn port_set(ports: Option<&Vec<ContainerPort>>) -> BTreeSet<PortKey> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone().unwrap_or_default(),
                p.container_port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}

fn tls_mount(container: &Container) -> Option<&VolumeMount> {
    container
        .volume_mounts
        .as_ref()?
        .iter()
        .find(|m| m.name == TLS_VOLUME)
}

fn tls_volume(pod: &PodSpec) -> Option<&Volume> {
    pod.volumes.as_ref()?.iter().find(|v| v.name == TLS_VOLUME)
}

fn tls_secret_name(volume: &Volume) -> Option<&str> {
    volume.secret.as_ref()?.secret_name.as_deref()
}

/// Insert, replace or remove the item named `name` so that it matches
/// `desired`. Returns whether the list changed.
fn sync_named<T: Clone>(
    items: &mut Vec<T>,
    name: &str,
    desired: Option<&T>,
    name_of: impl Fn(&T) -> &str,
    same: impl Fn(&T, &T) -> bool,
) -> bool {
    let current = items.iter().position(|item| name_of(item) == name);
    match (current, desired) {
        (None, None) => false,
        (None, Some(item)) => {
            items.push(item.clone());
            true
        }
        (Some(index), None) => {
            items.remove(index);
            true
        }
        (Some(index), Some(item)) => {
            if same(&items[index], item) {
                false
            } else {
                items[index] = item.clone();
                true
            }
        }
    }
}

/// Copy the workload fields this operator owns onto the existing object.
///
/// Owned: replicas, the config-hash annotation, and on the broker container
/// the image, resources, args, ports and the TLS mount, plus the TLS
/// volume. Service name and selector are immutable and never touched.
pub(crate) fn diff_statefulset(existing: &mut StatefulSet, desired: &StatefulSet) -> bool {
    let Some(desired_spec) = desired.spec.as_ref() else {
        return false;
    };
    let name = existing.name_any();
    let spec = existing.spec.get_or_insert_with(Default::default);
    let mut changed = false;

    if spec.replicas != desired_spec.replicas {
        info!(
            statefulset = %name,
            from = ?spec.replicas,
            to = ?desired_spec.replicas,
            "Scaling broker replicas"
        );
        spec.replicas = desired_spec.replicas;
        changed = true;
    }

    let desired_hash = desired_spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(CONFIG_HASH_ANNOTATION));
    if let Some(hash) = desired_hash {
        let annotations = spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default);
        if annotations.get(CONFIG_HASH_ANNOTATION) != Some(hash) {
            annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), hash.clone());
            changed = true;
        }
    }

    let Some(desired_pod) = desired_spec.template.spec.as_ref() else {
        return changed;
    };
    let Some(desired_container) = desired_pod
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
    else {
        return changed;
    };

    let pod = spec.template.spec.get_or_insert_with(Default::default);
    let Some(index) = pod.containers.iter().position(|c| c.name == CONTAINER_NAME) else {
        pod.containers.push(desired_container.clone());
        return true;
    };
    let container = &mut pod.containers[index];

    if container.image != desired_container.image {
        container.image = desired_container.image.clone();
        changed = true;
    }

    if !resources_equal(container.resources.as_ref(), desired_container.resources.as_ref()) {
        container.resources = desired_container.resources.clone();
        changed = true;
    }

    if container.args != desired_container.args {
        container.args = desired_container.args.clone();
        changed = true;
    }

    if port_set(container.ports.as_ref()) != port_set(desired_container.ports.as_ref()) {
        container.ports = desired_container.ports.clone();
        changed = true;
    }

    changed |= sync_named(
        container.volume_mounts.get_or_insert_with(Vec::new),
        TLS_VOLUME,
        tls_mount(desired_container),
        |m| m.name.as_str(),
        |a, b| a.mount_path == b.mount_path && a.read_only == b.read_only,
    );

    changed |= sync_named(
        pod.volumes.get_or_insert_with(Vec::new),
        TLS_VOLUME,
        tls_volume(desired_pod),
        |v| v.name.as_str(),
        |a, b| tls_secret_name(a) == tls_secret_name(b),
    );

    changed
}

#[async_trait]
impl<'a, S: ChildStore> Reconciler for StatefulSetReconciler<'a, S> {
    async fn reconcile(&self) -> Result<Requeue> {
        let config_hash = self.config_hash().await?;
        let desired = self.ctx.builder()?.build_statefulset(&config_hash);

        let outcome = converge(self.ctx, &desired, |existing, desired| {
            Ok(diff_statefulset(existing, desired))
        })
        .await?;

        Ok(match outcome {
            Outcome::Created | Outcome::Updated => Requeue::After(ROLLOUT_REQUEUE),
            Outcome::Unchanged => Requeue::Done,
        })
    }

    fn name(&self) -> &'static str {
        "statefulset"
    }
}
