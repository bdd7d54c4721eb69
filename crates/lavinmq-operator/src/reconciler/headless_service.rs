//! Headless service reconciler

use super::{converge, ReconcileContext, Reconciler, Requeue};
use crate::error::Result;
use crate::store::ChildStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeSet;

/// Keeps the discovery service's port list in line with the enabled listeners
pub struct HeadlessServiceReconciler<'a, S> {
    ctx: &'a ReconcileContext<S>,
}

impl<'a, S: ChildStore> HeadlessServiceReconciler<'a, S> {
    pub fn new(ctx: &'a ReconcileContext<S>) -> Self {
        Self { ctx }
    }
}

type PortKey = (String, i32, String, String);

/// Order-insensitive view of a port list with the API server's defaults
/// applied (TCP, target port equal to port).
fn port_set(ports: Option<&Vec<ServicePort>>) -> BTreeSet<PortKey> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            let target = match &p.target_port {
                Some(IntOrString::Int(port)) => port.to_string(),
                Some(IntOrString::String(name)) => name.clone(),
                None => p.port.to_string(),
            };
            (
                p.name.clone().unwrap_or_default(),
                p.port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                target,
            )
        })
        .collect()
}

/// Replace the port list when the set of ports differs. Selector and
/// cluster IP are fixed at creation.
pub(crate) fn diff_service(existing: &mut Service, desired: &Service) -> bool {
    let desired_ports = desired.spec.as_ref().and_then(|s| s.ports.as_ref());
    let spec = existing.spec.get_or_insert_with(Default::default);

    if port_set(spec.ports.as_ref()) == port_set(desired_ports) {
        return false;
    }

    spec.ports = desired_ports.cloned();
    true
}

#[async_trait]
impl<'a, S: ChildStore> Reconciler for HeadlessServiceReconciler<'a, S> {
    async fn reconcile(&self) -> Result<Requeue> {
        let desired = self.ctx.builder()?.build_headless_service();
        converge(self.ctx, &desired, |existing, desired| {
            Ok(diff_service(existing, desired))
        })
        .await?;
        Ok(Requeue::Done)
    }

    fn name(&self) -> &'static str {
        "headless-service"
    }
}
