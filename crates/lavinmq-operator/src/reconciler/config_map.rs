//! Config artifact reconciler

use super::{converge, ReconcileContext, Reconciler, Requeue};
use crate::config::CONFIG_FILE_NAME;
use crate::error::Result;
use crate::store::ChildStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;

/// Keeps the `lavinmq.ini` ConfigMap equal to the rendered document
pub struct ConfigMapReconciler<'a, S> {
    ctx: &'a ReconcileContext<S>,
}

impl<'a, S: ChildStore> ConfigMapReconciler<'a, S> {
    pub fn new(ctx: &'a ReconcileContext<S>) -> Self {
        Self { ctx }
    }
}

/// Replace the whole document when it differs byte for byte. Other keys
/// written by someone else are left alone.
pub(crate) fn diff_config_map(existing: &mut ConfigMap, desired: &ConfigMap) -> bool {
    let Some(document) = desired
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIG_FILE_NAME))
    else {
        return false;
    };

    let data = existing.data.get_or_insert_with(Default::default);
    if data.get(CONFIG_FILE_NAME) == Some(document) {
        return false;
    }

    data.insert(CONFIG_FILE_NAME.to_string(), document.clone());
    true
}

#[async_trait]
impl<'a, S: ChildStore> Reconciler for ConfigMapReconciler<'a, S> {
    async fn reconcile(&self) -> Result<Requeue> {
        let desired = self.ctx.builder()?.build_configmap()?;
        converge(self.ctx, &desired, |existing, desired| {
            Ok(diff_config_map(existing, desired))
        })
        .await?;
        Ok(Requeue::Done)
    }

    fn name(&self) -> &'static str {
        "config"
    }
}
