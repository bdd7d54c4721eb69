//! LavinMQ configuration rendering
//!
//! Turns a [`LavinMQ`] resource into the `lavinmq.ini` document mounted into
//! every broker pod. Rendering is pure and deterministic: the same resource
//! always produces the same bytes, which is what makes the `config-hash`
//! pod annotation a reliable restart trigger.

use crate::crd::LavinMQ;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Write};

/// ConfigMap key holding the rendered document
pub const CONFIG_FILE_NAME: &str = "lavinmq.ini";

/// Broker data directory inside the container
pub const DATA_DIR: &str = "/var/lib/lavinmq";

/// Directory the config volume is mounted on
pub const CONFIG_DIR: &str = "/etc/lavinmq";

/// Directory the TLS secret is mounted on
pub const TLS_DIR: &str = "/etc/lavinmq/tls";

/// Port used for replication between clustered brokers
pub const CLUSTERING_PORT: i32 = 5679;

const BIND_ALL: &str = "0.0.0.0";

/// Minimal INI writer that keeps sections and keys in insertion order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or append a section
    pub fn section(&mut self, name: &str) -> IniSection<'_> {
        let index = match self.sections.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.sections.push((name.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        IniSection {
            entries: &mut self.sections[index].1,
        }
    }

    /// Look up a value
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(n, _)| n == section)
            .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.as_str())
    }
}

impl Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, entries)) in self.sections.iter().enumerate() {
            if i > 0 {
                f.write_char('\n')?;
            }
            writeln!(f, "[{}]", name)?;
            for (key, value) in entries {
                writeln!(f, "{} = {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Mutable view of one section
pub struct IniSection<'a> {
    entries: &'a mut Vec<(String, String)>,
}

impl IniSection<'_> {
    /// Set a key, replacing an existing value in place
    pub fn set(&mut self, key: &str, value: impl Display) -> &mut Self {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    /// Set a numeric key unless it is zero
    pub fn set_nonzero<T>(&mut self, key: &str, value: T) -> &mut Self
    where
        T: Display + Default + PartialEq,
    {
        if value != T::default() {
            self.set(key, value);
        }
        self
    }

    /// Set a string key unless it is empty
    pub fn set_nonempty(&mut self, key: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.set(key, value);
        }
        self
    }
}

/// Build the configuration document for a LavinMQ resource
pub fn build_config(instance: &LavinMQ) -> Result<IniDocument> {
    let name = instance
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| OperatorError::InvalidConfig("instance name is required".to_string()))?;
    let spec = &instance.spec;
    let config = &spec.config;
    let mut doc = IniDocument::new();

    {
        let main = &config.main;
        let mut section = doc.section("main");
        section
            .set("data_dir", DATA_DIR)
            .set_nonempty("log_level", &main.log_level)
            .set_nonzero("consumer_timeout", main.consumer_timeout)
            .set_nonzero("default_consumer_prefetch", main.default_consumer_prefetch)
            .set_nonempty("default_user", &main.default_user)
            .set_nonempty("default_password", &main.default_password)
            .set_nonzero("free_disk_min", main.free_disk_min)
            .set_nonzero("free_disk_warn", main.free_disk_warn)
            .set_nonzero("socket_buffer_size", main.socket_buffer_size)
            .set_nonempty("tcp_keepalive", &main.tcp_keepalive)
            .set_nonzero("tcp_recv_buffer_size", main.tcp_recv_buffer_size)
            .set_nonzero("tcp_send_buffer_size", main.tcp_send_buffer_size)
            .set_nonempty("tls_ciphers", &main.tls_ciphers)
            .set_nonempty("tls_min_version", &main.tls_min_version)
            .set_nonzero("segment_size", main.segment_size)
            .set_nonzero("stats_interval", main.stats_interval)
            .set_nonzero("stats_log_size", main.stats_log_size);
        if let Some(nodelay) = main.tcp_nodelay {
            section.set("tcp_nodelay", nodelay);
        }
        if spec.tls_secret.is_some() {
            section
                .set("tls_cert", format!("{}/tls.crt", TLS_DIR))
                .set("tls_key", format!("{}/tls.key", TLS_DIR));
        }
    }

    doc.section("mgmt")
        .set("bind", BIND_ALL)
        .set_nonzero("port", config.mgmt.port)
        .set_nonzero("tls_port", config.mgmt.tls_port);

    doc.section("amqp")
        .set("bind", BIND_ALL)
        .set_nonzero("port", config.amqp.port)
        .set_nonzero("tls_port", config.amqp.tls_port)
        .set_nonzero("heartbeat", config.amqp.heartbeat)
        .set_nonzero("frame_max", config.amqp.frame_max)
        .set_nonzero("channel_max", config.amqp.channel_max)
        .set_nonzero("max_message_size", config.amqp.max_message_size);

    doc.section("mqtt")
        .set("bind", BIND_ALL)
        .set_nonzero("port", config.mqtt.port)
        .set_nonzero("tls_port", config.mqtt.tls_port)
        .set_nonzero("max_inflight_messages", config.mqtt.max_inflight_messages);

    {
        let mut section = doc.section("clustering");
        section.set("bind", BIND_ALL).set("port", CLUSTERING_PORT);
        if spec.has_etcd() {
            // Prefix keeps brokers sharing one etcd cluster apart
            section
                .set("enabled", true)
                .set("etcd_endpoints", spec.etcd_endpoints.join(","))
                .set("etcd_prefix", name);
        }
        section.set_nonzero("max_unsynced_actions", config.clustering.max_unsynced_actions);
    }

    Ok(doc)
}

/// Render the `lavinmq.ini` document for a LavinMQ resource
pub fn render_config(instance: &LavinMQ) -> Result<String> {
    let doc = build_config(instance)?;
    tracing::trace!(name = %instance.name_any(), "Rendered broker config");
    Ok(doc.to_string())
}

/// Hex SHA-256 digest of a rendered document
pub fn config_fingerprint(document: &str) -> String {
    hex::encode(Sha256::digest(document.as_bytes()))
}
