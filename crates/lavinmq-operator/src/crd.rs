//! Custom Resource Definitions for the LavinMQ Kubernetes Operator
//!
//! This module defines the `LavinMQ` CRD that describes a LavinMQ broker
//! deployment: image, replica count, listener ports, storage, optional etcd
//! endpoints for clustering, optional TLS material and broker tuning.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$")
        .expect("quantity regex is valid")
});

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-.a-z0-9]*[a-z0-9])?$").expect("name regex is valid")
});

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty_image").with_message("image is required".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 253 {
        return Err(ValidationError::new("name_too_long")
            .with_message("name exceeds 253 characters".into()));
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate etcd endpoint list
fn validate_endpoints(endpoints: &[String]) -> Result<(), ValidationError> {
    if endpoints.len() > 16 {
        return Err(ValidationError::new("too_many_endpoints")
            .with_message("maximum 16 etcd endpoints allowed".into()));
    }
    for endpoint in endpoints {
        if endpoint.trim().is_empty() || endpoint.contains(',') {
            return Err(ValidationError::new("invalid_endpoint").with_message(
                format!("'{}' is not a valid etcd endpoint", endpoint).into(),
            ));
        }
    }
    Ok(())
}

/// Validate broker log level
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "" | "trace" | "debug" | "info" | "notice" | "warn" | "error" | "fatal" | "none" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level").with_message(
            "logLevel must be one of: trace, debug, info, notice, warn, error, fatal, none".into(),
        )),
    }
}

/// LavinMQ custom resource definition
///
/// Represents a LavinMQ broker deployment. The operator watches these
/// resources and converges a ConfigMap, a headless Service, one
/// PersistentVolumeClaim per replica and a StatefulSet toward the spec.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "cloudamqp.com",
    version = "v1alpha1",
    kind = "LavinMQ",
    plural = "lavinmqs",
    shortname = "lmq",
    namespaced,
    status = "LavinMQStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LavinMQSpec {
    /// Container image running the broker
    #[serde(default = "default_image")]
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// Number of broker replicas (1-3). More than one requires etcd endpoints.
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, max = 3, message = "replicas must be between 1 and 3"))]
    pub replicas: i32,

    /// Resource requirements (CPU, memory)
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Data volume requested for every replica
    #[serde(default)]
    #[validate(nested)]
    pub data_volume_claim: StorageSpec,

    /// etcd endpoints used for clustering
    #[serde(default)]
    #[validate(custom(function = "validate_endpoints"))]
    pub etcd_endpoints: Vec<String>,

    /// Secret holding `tls.crt` and `tls.key`
    #[serde(default)]
    #[validate(nested)]
    pub tls_secret: Option<SecretReference>,

    /// Broker configuration parameters
    #[serde(default)]
    #[validate(nested)]
    pub config: BrokerConfig,
}

/// Storage specification for broker data
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage size (e.g., "10Gi") - must be valid Kubernetes quantity
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class name (empty uses the cluster default)
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub storage_class_name: Option<String>,

    /// Requested access modes. Claims are always created ReadWriteOnce.
    #[serde(default = "default_access_modes")]
    #[validate(custom(function = "validate_access_modes"))]
    pub access_modes: Vec<String>,
}

/// Validate PVC access modes
fn validate_access_modes(modes: &[String]) -> Result<(), ValidationError> {
    let valid_modes = [
        "ReadWriteOnce",
        "ReadOnlyMany",
        "ReadWriteMany",
        "ReadWriteOncePod",
    ];
    for mode in modes {
        if !valid_modes.contains(&mode.as_str()) {
            return Err(ValidationError::new("invalid_access_mode")
                .with_message(format!("'{}' is not a valid access mode", mode).into()));
        }
    }
    Ok(())
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
        }
    }
}

/// Reference to a Secret in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
pub struct SecretReference {
    /// Secret name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,
}

/// Broker configuration rendered into `lavinmq.ini`
///
/// Numeric fields left at zero and string fields left empty are not
/// rendered, so the broker falls back to its own defaults.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// `[main]` section
    #[serde(default)]
    #[validate(nested)]
    pub main: MainConfig,

    /// `[mgmt]` section (HTTP management interface)
    #[serde(default = "default_mgmt")]
    #[validate(nested)]
    pub mgmt: ListenerConfig,

    /// `[amqp]` section
    #[serde(default)]
    #[validate(nested)]
    pub amqp: AmqpConfig,

    /// `[mqtt]` section
    #[serde(default)]
    #[validate(nested)]
    pub mqtt: MqttConfig,

    /// `[clustering]` section
    #[serde(default)]
    pub clustering: ClusteringConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            main: MainConfig::default(),
            mgmt: default_mgmt(),
            amqp: AmqpConfig::default(),
            mqtt: MqttConfig::default(),
            clustering: ClusteringConfig::default(),
        }
    }
}

/// `[main]` section tuning
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MainConfig {
    /// Consumer acknowledgement timeout in milliseconds
    #[serde(default)]
    pub consumer_timeout: u64,

    /// Default prefetch for new consumers
    #[serde(default)]
    pub default_consumer_prefetch: u32,

    /// Default user created on first start
    #[serde(default)]
    pub default_user: String,

    /// Password hash for the default user
    #[serde(default)]
    pub default_password: String,

    /// Stop accepting publishes below this many free bytes
    #[serde(default)]
    pub free_disk_min: u64,

    /// Warn below this many free bytes
    #[serde(default)]
    pub free_disk_warn: u64,

    /// Broker log level
    #[serde(default)]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    #[serde(default)]
    pub socket_buffer_size: u32,

    #[serde(default)]
    pub tcp_nodelay: Option<bool>,

    /// Keepalive as `idle:interval:probes`
    #[serde(default)]
    pub tcp_keepalive: String,

    #[serde(default)]
    pub tcp_recv_buffer_size: u32,

    #[serde(default)]
    pub tcp_send_buffer_size: u32,

    /// OpenSSL cipher list
    #[serde(default)]
    pub tls_ciphers: String,

    /// Minimum TLS version (e.g. "1.2")
    #[serde(default)]
    pub tls_min_version: String,

    /// Message segment file size in bytes
    #[serde(default)]
    pub segment_size: u64,

    /// Statistics sampling interval in milliseconds
    #[serde(default)]
    pub stats_interval: u32,

    /// Number of statistics samples kept
    #[serde(default)]
    pub stats_log_size: u32,
}

/// Plaintext and TLS port pair for one listener
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Plaintext port. Zero leaves the broker default, negative disables it.
    #[serde(default)]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub port: i32,

    /// TLS port. Zero leaves it unset.
    #[serde(default)]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub tls_port: i32,
}

/// `[amqp]` section
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AmqpConfig {
    /// Plaintext port. Zero leaves the broker default, negative disables it.
    #[serde(default = "default_amqp_port")]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub port: i32,

    /// TLS port. Zero leaves it unset.
    #[serde(default)]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub tls_port: i32,

    /// Heartbeat interval in seconds
    #[serde(default)]
    pub heartbeat: u32,

    #[serde(default)]
    pub frame_max: u32,

    #[serde(default)]
    pub channel_max: u32,

    #[serde(default)]
    pub max_message_size: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            port: default_amqp_port(),
            tls_port: 0,
            heartbeat: 0,
            frame_max: 0,
            channel_max: 0,
            max_message_size: 0,
        }
    }
}

/// `[mqtt]` section
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    /// Plaintext port. Zero leaves the broker default, negative disables it.
    #[serde(default = "default_mqtt_port")]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub port: i32,

    /// TLS port. Zero leaves it unset.
    #[serde(default)]
    #[validate(range(max = 65535, message = "port must not exceed 65535"))]
    pub tls_port: i32,

    #[serde(default)]
    pub max_inflight_messages: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            port: default_mqtt_port(),
            tls_port: 0,
            max_inflight_messages: 0,
        }
    }
}

/// `[clustering]` section tuning
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringConfig {
    /// Actions a follower may lag behind before the leader blocks
    #[serde(default)]
    pub max_unsynced_actions: u32,
}

/// Status of a LavinMQ resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LavinMQStatus {
    /// Current phase of the deployment
    pub phase: LavinMQPhase,

    /// Total number of replicas
    pub replicas: i32,

    /// Number of ready replicas
    pub ready_replicas: i32,

    /// Current observed generation
    pub observed_generation: i64,

    /// Conditions describing broker state
    #[serde(default)]
    pub conditions: Vec<LavinMQCondition>,

    /// Last time the status was updated
    pub last_updated: Option<String>,

    /// Error message if any
    pub message: Option<String>,
}

/// Phase of the deployment lifecycle
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LavinMQPhase {
    #[default]
    Pending,
    /// Children created, no replica ready yet
    Provisioning,
    /// All replicas ready
    Running,
    /// Some replicas are rolling
    Updating,
    /// Last reconcile pass failed
    Failed,
}

/// Condition describing an aspect of broker state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LavinMQCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last transition time
    pub last_transition_time: Option<String>,
}

// Default value functions
fn default_image() -> String {
    "cloudamqp/lavinmq:2.2.0".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_mgmt() -> ListenerConfig {
    ListenerConfig {
        port: 15672,
        tls_port: 0,
    }
}

fn default_amqp_port() -> i32 {
    5672
}

fn default_mqtt_port() -> i32 {
    1883
}

impl Default for LavinMQSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            replicas: default_replicas(),
            resources: None,
            data_volume_claim: StorageSpec::default(),
            etcd_endpoints: Vec::new(),
            tls_secret: None,
            config: BrokerConfig::default(),
        }
    }
}

impl LavinMQSpec {
    /// Whether etcd endpoints are configured
    pub fn has_etcd(&self) -> bool {
        !self.etcd_endpoints.is_empty()
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, instance_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(instance_name);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "lavinmq-operator".to_string(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(&self, instance_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "lavinmq".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            instance_name.to_string(),
        );
        labels
    }
}
