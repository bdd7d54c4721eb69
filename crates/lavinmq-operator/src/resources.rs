//! Kubernetes Resource Builders
//!
//! This module computes the desired child objects (ConfigMap, headless
//! Service, PersistentVolumeClaims, StatefulSet) from a LavinMQ resource.
//! Builders are pure; fetching, diffing and writing live in
//! [`crate::reconciler`].

use crate::config::{self, CLUSTERING_PORT, CONFIG_DIR, CONFIG_FILE_NAME, DATA_DIR, TLS_DIR};
use crate::crd::{LavinMQ, LavinMQSpec};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    ExecAction, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;

/// Name of the broker container
pub const CONTAINER_NAME: &str = "lavinmq";

/// Pod-template annotation carrying the config fingerprint
pub const CONFIG_HASH_ANNOTATION: &str = "config-hash";

/// Volume claim template and data volume name
pub const DATA_VOLUME: &str = "data";

/// Volume and mount name of the TLS secret
pub const TLS_VOLUME: &str = "tls";

/// Access mode forced on every data claim
pub const DATA_ACCESS_MODE: &str = "ReadWriteOnce";

const BROKER_COMMAND: &str = "/usr/bin/lavinmq";

const PROBE_COMMAND: &str =
    "/usr/bin/lavinmqctl status || /usr/bin/lavinmqctl status | grep -q follower";

/// Builder for generating Kubernetes resources from a LavinMQ resource
pub struct ResourceBuilder<'a> {
    instance: &'a LavinMQ,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(instance: &'a LavinMQ) -> Result<Self> {
        let name =
            instance.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("instance name is required".to_string())
            })?;

        let namespace = instance
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            instance,
            name,
            namespace,
        })
    }

    fn spec(&self) -> &LavinMQSpec {
        &self.instance.spec
    }

    /// Owner reference attached to every child for cascading deletion
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: LavinMQ::api_version(&()).to_string(),
            kind: LavinMQ::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.instance.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.spec().get_labels(&self.name)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Enabled listeners in a fixed order as (port name, port)
    ///
    /// Plaintext ports are exposed when positive; a negative port disables
    /// the listener and zero leaves the broker default unexposed. TLS ports
    /// are exposed when positive.
    pub fn listener_ports(&self) -> Vec<(&'static str, i32)> {
        let spec = self.spec();
        let config = &spec.config;
        let mut ports = Vec::new();

        if spec.has_etcd() {
            ports.push(("clustering", CLUSTERING_PORT));
        }

        let candidates = [
            ("http", config.mgmt.port),
            ("https", config.mgmt.tls_port),
            ("amqp", config.amqp.port),
            ("amqps", config.amqp.tls_port),
            ("mqtt", config.mqtt.port),
            ("mqtts", config.mqtt.tls_port),
        ];
        ports.extend(candidates.into_iter().filter(|(_, port)| *port > 0));
        ports
    }

    /// Build the ConfigMap holding `lavinmq.ini`
    pub fn build_configmap(&self) -> Result<ConfigMap> {
        let document = config::render_config(self.instance)?;

        Ok(ConfigMap {
            metadata: self.metadata(self.name.clone()),
            data: Some(BTreeMap::from([(CONFIG_FILE_NAME.to_string(), document)])),
            ..Default::default()
        })
    }

    /// Build the headless service for pod discovery
    pub fn build_headless_service(&self) -> Service {
        let ports = self
            .listener_ports()
            .into_iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        Service {
            metadata: self.metadata(self.name.clone()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.spec().get_selector_labels(&self.name)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Name of the data claim bound to a replica ordinal
    pub fn pvc_name(&self, ordinal: i32) -> String {
        format!("{}-{}-{}", DATA_VOLUME, self.name, ordinal)
    }

    /// Build the data claim for one replica ordinal.
    ///
    /// The name matches what the StatefulSet's `data` claim template
    /// resolves to, so pods bind to the claims created here.
    pub fn build_pvc(&self, ordinal: i32) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: self.metadata(self.pvc_name(ordinal)),
            spec: Some(self.pvc_spec()),
            ..Default::default()
        }
    }

    /// Build one data claim per replica
    pub fn build_pvcs(&self) -> Vec<PersistentVolumeClaim> {
        (0..self.spec().replicas.max(0))
            .map(|ordinal| self.build_pvc(ordinal))
            .collect()
    }

    fn pvc_spec(&self) -> PersistentVolumeClaimSpec {
        let storage = &self.spec().data_volume_claim;
        PersistentVolumeClaimSpec {
            access_modes: Some(vec![DATA_ACCESS_MODE.to_string()]),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// CLI arguments for the broker process
    pub fn cli_args(&self) -> Vec<String> {
        vec![
            "--bind=0.0.0.0".to_string(),
            "--guest-only-loopback=false".to_string(),
            format!(
                "--clustering-advertised-uri=tcp://$(POD_NAME).{}.$(POD_NAMESPACE).svc.cluster.local:{}",
                self.name, CLUSTERING_PORT
            ),
        ]
    }

    /// Container ports matching [`Self::listener_ports`]
    pub fn container_ports(&self) -> Vec<ContainerPort> {
        self.listener_ports()
            .into_iter()
            .map(|(name, port)| ContainerPort {
                name: Some(name.to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect()
    }

    /// Secret volume for TLS material, when a secret is referenced
    pub fn tls_volume(&self) -> Option<Volume> {
        self.spec().tls_secret.as_ref().map(|secret| Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Mount of the TLS volume, when a secret is referenced
    pub fn tls_volume_mount(&self) -> Option<VolumeMount> {
        self.spec().tls_secret.as_ref().map(|_| VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        })
    }

    fn status_probe() -> Probe {
        Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    PROBE_COMMAND.to_string(),
                ]),
            }),
            ..Default::default()
        }
    }

    fn field_env(name: &str, field_path: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field_path.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the broker container
    fn build_container(&self) -> Container {
        let mut volume_mounts = vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: self.name.clone(),
                mount_path: CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];
        volume_mounts.extend(self.tls_volume_mount());

        Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.spec().image.clone()),
            command: Some(vec![BROKER_COMMAND.to_string()]),
            args: Some(self.cli_args()),
            env: Some(vec![
                Self::field_env("POD_NAME", "metadata.name"),
                Self::field_env("POD_NAMESPACE", "metadata.namespace"),
            ]),
            ports: Some(self.container_ports()),
            resources: self.spec().resources.clone(),
            // Liveness and readiness only start once startup succeeds
            startup_probe: Some(Probe {
                failure_threshold: Some(30),
                period_seconds: Some(10),
                ..Self::status_probe()
            }),
            liveness_probe: Some(Probe {
                period_seconds: Some(10),
                ..Self::status_probe()
            }),
            readiness_probe: Some(Probe {
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..Self::status_probe()
            }),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    /// Build the StatefulSet running the brokers
    pub fn build_statefulset(&self, config_hash: &str) -> StatefulSet {
        let spec = self.spec();
        let selector_labels = spec.get_selector_labels(&self.name);

        let mut volumes = vec![Volume {
            name: self.name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        volumes.extend(self.tls_volume());

        let pod_spec = PodSpec {
            containers: vec![self.build_container()],
            volumes: Some(volumes),
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        let claim_template = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME.to_string()),
                ..Default::default()
            },
            spec: Some(self.pvc_spec()),
            ..Default::default()
        };

        StatefulSet {
            metadata: self.metadata(self.name.clone()),
            spec: Some(StatefulSetSpec {
                service_name: self.name.clone(),
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        annotations: Some(BTreeMap::from([(
                            CONFIG_HASH_ANNOTATION.to_string(),
                            config_hash.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates: Some(vec![claim_template]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
