//! Declarative cluster topology.
//!
//! A topology file is loaded from YAML, defaulted, validated and then stored
//! next to the cluster metadata. It is re-read on every operation.

mod defaults;
mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{Component, ComponentSpec};
use crate::config_map::ConfigMap;

pub use defaults::*;
pub use validate::ValidationError;

#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("unable to read topology {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to write topology {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to parse topology {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("unable to serialize topology: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Whole-cluster topology description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub global: GlobalOptions,
    pub milvus_servers: Vec<MilvusServer>,
    pub etcd_servers: Vec<EtcdServer>,
    pub minio_servers: Vec<MinioServer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pulsar_servers: Vec<PulsarServer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub monitoring_servers: Vec<MonitoringServer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grafana_servers: Vec<GrafanaServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// relative paths are resolved against the cluster directory
    pub deploy_dir: String,
    pub data_dir: String,
    pub log_dir: String,
    #[serde(skip_serializing_if = "TlsConfig::is_disabled_default")]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// `one-way` or `mutual`
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Kubernetes secret holding `tls.crt`, `tls.key` and `ca.crt`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl TlsConfig {
    fn is_disabled_default(&self) -> bool {
        *self == Self::default()
    }

    pub fn tls_mode(&self) -> Option<TlsMode> {
        self.mode.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    OneWay,
    Mutual,
}

impl TlsMode {
    /// Value of `common.security.tlsMode` in the Milvus configuration
    pub fn milvus_value(&self) -> u8 {
        match self {
            Self::OneWay => 1,
            Self::Mutual => 2,
        }
    }
}

impl FromStr for TlsMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one-way" | "oneway" => Ok(Self::OneWay),
            "mutual" | "two-way" => Ok(Self::Mutual),
            other => Err(ValidationError::new(
                "global.tls.mode",
                format!("must be one of 'one-way' or 'mutual', got '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MilvusServer {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub mode: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentSpec>,
    /// passed through untouched into the Milvus configuration
    #[serde(skip_serializing_if = "ConfigMap::is_empty")]
    pub config: ConfigMap,
}

impl MilvusServer {
    /// Desired state for a component, looked up by any accepted spelling
    pub fn component(&self, component: Component) -> Option<&ComponentSpec> {
        self.components
            .iter()
            .find(|(name, _)| name.parse::<Component>().ok() == Some(component))
            .map(|(_, spec)| spec)
    }

    pub fn component_mut(&mut self, component: Component) -> &mut ComponentSpec {
        let key = self
            .components
            .keys()
            .find(|name| name.parse::<Component>().ok() == Some(component))
            .cloned()
            .unwrap_or_else(|| component.name().to_owned());
        self.components.entry(key).or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdServer {
    pub host: String,
    pub client_port: u16,
    pub peer_port: u16,
    /// an externally managed etcd the cluster connects to
    #[serde(skip_serializing_if = "is_false")]
    pub external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioServer {
    pub host: String,
    pub port: u16,
    pub console_port: u16,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(skip_serializing_if = "is_false")]
    pub external: bool,
    /// Kubernetes secret with the credentials of an external object store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsarServer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringServer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrafanaServer {
    pub host: String,
    pub port: u16,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// How Milvus itself is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Standalone,
    #[serde(alias = "cluster")]
    Distributed,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standalone" => Ok(Self::Standalone),
            "distributed" | "cluster" => Ok(Self::Distributed),
            other => Err(ValidationError::new(
                "milvus_servers[0].mode",
                format!("must be 'standalone' or 'distributed', got '{other}'"),
            )),
        }
    }
}

impl Topology {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading topology");
        let contents = fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| TopologyError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TopologyError> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents).map_err(|source| TopologyError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Single-host topology used when the caller supplies no file
    pub fn standalone() -> Self {
        let mut topology = Self {
            milvus_servers: vec![MilvusServer {
                host: LOCALHOST.to_owned(),
                ..Default::default()
            }],
            etcd_servers: vec![EtcdServer {
                host: LOCALHOST.to_owned(),
                ..Default::default()
            }],
            minio_servers: vec![MinioServer {
                host: LOCALHOST.to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };
        topology.apply_defaults();
        topology
    }

    /// Raw mode of the first Milvus server; `standalone` when there is none
    pub fn mode(&self) -> &str {
        self.milvus_servers
            .first()
            .map(|server| server.mode.as_str())
            .filter(|mode| !mode.is_empty())
            .unwrap_or(STANDALONE)
    }

    pub fn deploy_mode(&self) -> Result<DeployMode, ValidationError> {
        self.mode().parse()
    }

    /// `distributed` and the legacy `cluster` spelling are equivalent
    pub fn is_distributed(&self) -> bool {
        matches!(self.deploy_mode(), Ok(DeployMode::Distributed))
    }

    pub fn primary(&self) -> Option<&MilvusServer> {
        self.milvus_servers.first()
    }

    pub fn primary_mut(&mut self) -> Option<&mut MilvusServer> {
        self.milvus_servers.first_mut()
    }

    pub fn milvus_port(&self) -> u16 {
        self.primary()
            .map(|server| server.port)
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_MILVUS_PORT)
    }

    pub fn metrics_port(&self) -> u16 {
        self.primary()
            .map(|server| server.metrics_port)
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_METRICS_PORT)
    }

    /// Desired replica count of a component; 1 unless overridden
    pub fn desired_replicas(&self, component: Component) -> i32 {
        self.primary()
            .and_then(|server| server.component(component))
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn has_monitoring(&self) -> bool {
        !self.monitoring_servers.is_empty() || !self.grafana_servers.is_empty()
    }
}
