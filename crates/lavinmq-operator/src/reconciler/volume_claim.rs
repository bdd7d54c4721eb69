//! Per-replica data claim reconciler
//!
//! Claims may only grow. A smaller size or a different storage class is a
//! hard error and the stored claim is left as it is.

use super::{converge, ReconcileContext, Reconciler, Requeue};
use crate::error::{OperatorError, Result};
use crate::quantity::compare_quantities;
use crate::store::ChildStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::cmp::Ordering;
use tracing::info;

/// Keeps one data claim per replica ordinal at the requested size
pub struct VolumeClaimReconciler<'a, S> {
    ctx: &'a ReconcileContext<S>,
}

impl<'a, S: ChildStore> VolumeClaimReconciler<'a, S> {
    pub fn new(ctx: &'a ReconcileContext<S>) -> Self {
        Self { ctx }
    }
}

fn storage_request(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

/// Grow the storage request when the desired size is larger.
///
/// Access mode is never touched after creation. A storage class is only
/// compared when one is requested, since the cluster fills in its default
/// class otherwise.
pub(crate) fn diff_claim(
    existing: &mut PersistentVolumeClaim,
    desired: &PersistentVolumeClaim,
) -> Result<bool> {
    let claim = existing.name_any();

    let requested_class = desired
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone());
    let current_class = existing
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone());
    if requested_class.is_some() && requested_class != current_class {
        return Err(OperatorError::StorageClassChange {
            claim,
            current: current_class,
            requested: requested_class,
        });
    }

    let Some(requested) = storage_request(desired).cloned() else {
        return Ok(false);
    };

    if let Some(current) = storage_request(existing) {
        match compare_quantities(&current.0, &requested.0)? {
            Ordering::Equal => return Ok(false),
            Ordering::Greater => {
                return Err(OperatorError::StorageShrink {
                    claim,
                    current: current.0.clone(),
                    requested: requested.0,
                })
            }
            Ordering::Less => {
                info!(claim = %claim, from = %current.0, to = %requested.0, "Expanding volume claim");
            }
        }
    }

    existing
        .spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(Default::default)
        .insert("storage".to_string(), requested);
    Ok(true)
}

#[async_trait]
impl<'a, S: ChildStore> Reconciler for VolumeClaimReconciler<'a, S> {
    async fn reconcile(&self) -> Result<Requeue> {
        // Claims above the replica count are kept when scaling down
        for desired in self.ctx.builder()?.build_pvcs() {
            converge(self.ctx, &desired, diff_claim).await?;
        }
        Ok(Requeue::Done)
    }

    fn name(&self) -> &'static str {
        "volume-claims"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::fixtures::{context, instance};
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim(size: &str, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-broker-0".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: class.map(str::to_string),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_size_in_other_units() {
        let mut existing = claim("1Gi", None);
        assert!(!diff_claim(&mut existing, &claim("1024Mi", None)).unwrap());
    }

    #[test]
    fn test_grow() {
        let mut existing = claim("10Gi", Some("fast"));
        assert!(diff_claim(&mut existing, &claim("20Gi", None)).unwrap());
        assert_eq!(storage_request(&existing), Some(&Quantity("20Gi".to_string())));
        assert_eq!(
            existing.spec.unwrap().storage_class_name,
            Some("fast".to_string())
        );
    }

    #[test]
    fn test_shrink_is_rejected() {
        let mut existing = claim("10Gi", None);
        let err = diff_claim(&mut existing, &claim("5Gi", None)).unwrap_err();

        assert!(err.to_string().starts_with("volume size decreased, not supported"));
        assert_eq!(storage_request(&existing), Some(&Quantity("10Gi".to_string())));
    }

    #[test]
    fn test_storage_class_change_is_rejected() {
        let mut existing = claim("10Gi", Some("standard"));
        let err = diff_claim(&mut existing, &claim("10Gi", Some("fast"))).unwrap_err();
        assert!(matches!(err, OperatorError::StorageClassChange { .. }));
    }

    #[tokio::test]
    async fn test_shrink_leaves_stored_claim() {
        let store = MemoryStore::new();
        let mut lmq = instance("broker");
        lmq.spec.data_volume_claim.size = "20Gi".to_string();
        let ctx = context(lmq.clone(), &store);
        VolumeClaimReconciler::new(&ctx).reconcile().await.unwrap();

        lmq.spec.data_volume_claim.size = "10Gi".to_string();
        let ctx = context(lmq, &store);
        let err = VolumeClaimReconciler::new(&ctx).reconcile().await.unwrap_err();
        assert!(matches!(err, OperatorError::StorageShrink { .. }));

        let stored: PersistentVolumeClaim = store.fetch("data-broker-0").unwrap();
        assert_eq!(storage_request(&stored), Some(&Quantity("20Gi".to_string())));
        assert_eq!(store.writes_for::<PersistentVolumeClaim>("data-broker-0"), 1);
    }

    #[tokio::test]
    async fn test_scale_down_keeps_claims() {
        let store = MemoryStore::new();
        let mut lmq = instance("broker");
        lmq.spec.replicas = 3;
        let ctx = context(lmq.clone(), &store);
        VolumeClaimReconciler::new(&ctx).reconcile().await.unwrap();

        lmq.spec.replicas = 1;
        let ctx = context(lmq, &store);
        VolumeClaimReconciler::new(&ctx).reconcile().await.unwrap();

        assert_eq!(store.names::<PersistentVolumeClaim>().len(), 3);
        assert_eq!(store.write_count(), 3);
    }
}
