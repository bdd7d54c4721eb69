//! # LavinMQ Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing LavinMQ message broker
//! clusters from a single `LavinMQ` custom resource.
//!
//! ## Features
//!
//! - **Custom Resource Definition**: `LavinMQ` (`cloudamqp.com/v1alpha1`) with validation
//! - **Idempotent Reconciliation**: per-child fetch, diff and replace with conflict retry
//! - **Config Rollout**: the rendered `lavinmq.ini` is fingerprinted into the pod template
//! - **Safe Storage**: data claims may grow but never shrink or change class
//! - **Admission Webhook**: refuses unsafe replica and etcd transitions
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lavinmq_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, RetryConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! A reconcile pass runs four reconcilers in a fixed order:
//!
//! 1. **Config**: the `lavinmq.ini` ConfigMap
//! 2. **Headless Service**: pod discovery and listener ports
//! 3. **Volume Claims**: one data claim per replica
//! 4. **StatefulSet**: the brokers, annotated with the config fingerprint
//!
//! The first error aborts the pass and is reported in the resource's status.
//! Topology rules are enforced earlier, at admission time.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`config`] - `lavinmq.ini` rendering and fingerprinting
//! - [`resources`] - Kubernetes resource builders (StatefulSet, Service, ConfigMap, PVC)
//! - [`reconciler`] - Per-child reconcilers and the reconcile pass
//! - [`controller`] - Controller setup, status and error policy
//! - [`topology`] - Replica and etcd transition rules
//! - [`webhook`] - Validating admission webhook
//! - [`error`] - Error types for operator operations
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: cloudamqp.com/v1alpha1
//! kind: LavinMQ
//! metadata:
//!   name: broker
//! spec:
//!   replicas: 3
//!   etcdEndpoints:
//!     - etcd-0.etcd:2379
//!   dataVolumeClaim:
//!     size: 20Gi
//!   config:
//!     amqp:
//!       tlsPort: 5671
//! ```

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod quantity;
pub mod reconciler;
pub mod resources;
pub mod retry;
pub mod store;
pub mod topology;
pub mod webhook;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::run_controller;
    pub use crate::crd::{LavinMQ, LavinMQSpec, LavinMQStatus};
    pub use crate::error::{OperatorError, Result};
    pub use crate::reconciler::{reconcile_all, ReconcileContext, Reconciler, Requeue};
    pub use crate::retry::RetryConfig;
    pub use crate::store::{ChildStore, KubeStore};
}
