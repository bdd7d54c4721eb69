//! LavinMQ Controller
//!
//! This module wires the reconcile pass into a `kube` runtime controller.
//! It watches LavinMQ resources and the children they own, runs
//! [`reconcile_all`] against the API server and reports the outcome in the
//! resource's status.

use crate::crd::{LavinMQ, LavinMQCondition, LavinMQPhase, LavinMQStatus};
use crate::error::{OperatorError, Result};
use crate::reconciler::{reconcile_all, ReconcileContext, Requeue};
use crate::retry::RetryConfig;
use crate::store::{ChildStore, KubeStore};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Condition set while at least one broker is ready
pub const CONDITION_AVAILABLE: &str = "Available";

/// Condition set while the last pass failed
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-resource error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Retry budget for conflicting child writes
    pub retry: RetryConfig,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("lavinmq_operator_reconciliations_total"),
            errors: metrics::counter!("lavinmq_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("lavinmq_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn scoped_api<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: kube::Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Start the LavinMQ controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    retry: RetryConfig,
) -> Result<()> {
    let instances: Api<LavinMQ> = scoped_api(&client, &namespace);

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
        retry,
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LavinMQ controller"
    );

    Controller::new(instances, Config::default())
        .owns(scoped_api::<StatefulSet>(&client, &namespace), Config::default())
        .owns(scoped_api::<Service>(&client, &namespace), Config::default())
        .owns(scoped_api::<ConfigMap>(&client, &namespace), Config::default())
        .owns(
            scoped_api::<PersistentVolumeClaim>(&client, &namespace),
            Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!("LavinMQ controller stopped");
    Ok(())
}

fn error_key(instance: &LavinMQ) -> String {
    format!(
        "{}/{}",
        instance.namespace().unwrap_or_default(),
        instance.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(instance, ctx), fields(name = %instance.name_any(), namespace = instance.namespace()))]
async fn reconcile(instance: Arc<LavinMQ>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = apply_instance(instance.clone(), &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match &result {
        // Reset error backoff counter on success
        Ok(_) => {
            ctx.error_counts.remove(&error_key(&instance));
        }
        Err(_) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
        }
    }

    result
}

/// Validate the spec before any child is touched
fn validate_instance(instance: &LavinMQ) -> Result<()> {
    if let Err(errors) = instance.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %instance.name_any(), errors = %error_msg, "Spec validation failed");
        return Err(OperatorError::ValidationError(error_msg));
    }
    Ok(())
}

/// Run one pass and record its outcome in the status
async fn apply_instance(instance: Arc<LavinMQ>, ctx: &ControllerContext) -> Result<Action> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Reconciling LavinMQ");

    let outcome = run_pass(instance.clone(), ctx, &namespace).await;

    let status = match &outcome {
        Ok((_, sts_status)) => build_status(&instance, sts_status.as_ref(), None),
        Err(e) => build_status(&instance, None, Some(e)),
    };

    // A status write is itself a watch event; only write on real change
    let changed = status_changed(instance.status.as_ref(), &status);

    match outcome {
        Ok((requeue, _)) => {
            if changed {
                update_status(&ctx.client, &namespace, &name, status).await?;
            }
            info!(name = %name, "Reconciliation complete");

            let default = Duration::from_secs(DEFAULT_REQUEUE_SECONDS);
            Ok(Action::requeue(match requeue {
                Requeue::Done => default,
                Requeue::After(delay) => delay.min(default),
            }))
        }
        Err(e) => {
            // The pass error wins over a failed status write
            if changed {
                if let Err(status_err) = update_status(&ctx.client, &namespace, &name, status).await
                {
                    warn!(name = %name, error = %status_err, "Failed to record failure status");
                }
            }
            Err(e)
        }
    }
}

async fn run_pass(
    instance: Arc<LavinMQ>,
    ctx: &ControllerContext,
    namespace: &str,
) -> Result<(Requeue, Option<StatefulSetStatus>)> {
    validate_instance(&instance)?;

    let store = KubeStore::new(ctx.client.clone(), namespace);
    let pass = ReconcileContext::new(instance, store, ctx.retry.clone())?;
    let requeue = reconcile_all(&pass).await?;

    let sts: Option<StatefulSet> = pass.store().get(pass.name()).await?;
    Ok((requeue, sts.and_then(|s| s.status)))
}

/// Build a condition, keeping the previous transition time while the
/// status value is unchanged
fn condition(
    previous: &[LavinMQCondition],
    condition_type: &str,
    status: bool,
    reason: &str,
    message: Option<String>,
    now: &str,
) -> LavinMQCondition {
    let status = if status { "True" } else { "False" }.to_string();
    let last_transition_time = previous
        .iter()
        .find(|c| c.condition_type == condition_type && c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    LavinMQCondition {
        condition_type: condition_type.to_string(),
        status,
        reason: Some(reason.to_string()),
        message,
        last_transition_time: Some(last_transition_time),
    }
}

/// Build the status from the StatefulSet status, or from the pass error
fn build_status(
    instance: &LavinMQ,
    sts_status: Option<&StatefulSetStatus>,
    error: Option<&OperatorError>,
) -> LavinMQStatus {
    let now = Utc::now().to_rfc3339();
    let previous = instance.status.clone().unwrap_or_default();
    let desired_replicas = instance.spec.replicas;

    let (replicas, ready_replicas) = match (sts_status, error) {
        (Some(s), _) => (s.replicas, s.ready_replicas.unwrap_or(0)),
        (None, Some(_)) => (previous.replicas, previous.ready_replicas),
        (None, None) => (0, 0),
    };

    let phase = match error {
        Some(_) => LavinMQPhase::Failed,
        None if ready_replicas == 0 => LavinMQPhase::Provisioning,
        None if ready_replicas >= desired_replicas => LavinMQPhase::Running,
        None => LavinMQPhase::Updating,
    };

    let available = ready_replicas > 0 && error.is_none();
    let conditions = vec![
        condition(
            &previous.conditions,
            CONDITION_AVAILABLE,
            available,
            if available {
                "ReplicasReady"
            } else if error.is_some() {
                "ReconcileFailed"
            } else {
                "NoReplicasReady"
            },
            Some(format!(
                "{}/{} replicas ready",
                ready_replicas, desired_replicas
            )),
            &now,
        ),
        condition(
            &previous.conditions,
            CONDITION_DEGRADED,
            error.is_some(),
            if error.is_some() {
                "ReconcileFailed"
            } else {
                "Reconciled"
            },
            error.map(|e| e.to_string()),
            &now,
        ),
    ];

    LavinMQStatus {
        phase,
        replicas,
        ready_replicas,
        observed_generation: instance.metadata.generation.unwrap_or(0),
        conditions,
        last_updated: Some(now),
        message: error.map(|e| e.to_string()),
    }
}

/// Whether `next` differs from the stored status in anything but its timestamp
fn status_changed(previous: Option<&LavinMQStatus>, next: &LavinMQStatus) -> bool {
    match previous {
        Some(previous) => {
            let mut previous = previous.clone();
            previous.last_updated = next.last_updated.clone();
            previous != *next
        }
        None => true,
    }
}

/// Update the status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: LavinMQStatus,
) -> Result<()> {
    let api: Api<LavinMQ> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, phase = ?status.phase, "Updating status");

    let patch = serde_json::json!({
        "status": status
    });

    let patch_params = PatchParams::default();
    api.patch_status(name, &patch_params, &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Backoff before the next attempt after `retries` consecutive failures
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    // Spec errors repeat until the resource is edited, which triggers anyway
    if !error.is_retryable() {
        return Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS);
    }

    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

/// Error policy for the controller: exponential backoff per resource
fn error_policy(
    instance: Arc<LavinMQ>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = error_key(&instance);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
