use std::io::Error as IoError;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Error as AnyError;
use fluvio_command::CommandError;
use k8_config::ConfigError as K8ConfigError;

use crate::meta::MetaError;
use crate::topology::{TopologyError, ValidationError};

/// The types of errors that can occur during cluster management
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// No cluster with this name is recorded
    #[error("cluster '{0}' not found")]
    NotFound(String),
    /// A cluster with this name is already recorded
    #[error("cluster '{0}' already exists")]
    AlreadyExists(String),
    /// The request or topology is malformed
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
    /// Another mutating operation holds the cluster lock
    #[error("cluster '{name}' is busy with another operation (remove {path:?} if it is stale)")]
    Locked { name: String, path: PathBuf },
    /// Preflight checks failed before deploying
    #[error("preflight checks failed: {0}")]
    Precheck(String),
    /// A backend operation failed; the source is kept intact
    #[error("failed to {operation} cluster '{cluster}': {source}")]
    Operation {
        operation: &'static str,
        cluster: String,
        #[source]
        source: BackendError,
    },
    /// Backend error passed through verbatim (cancellation)
    #[error(transparent)]
    Backend(BackendError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Store(MetaError),
    #[error(transparent)]
    Io(#[from] IoError),
}

impl ClusterError {
    /// Wraps a backend error with the operation and cluster name.
    ///
    /// Cancellation is never wrapped so callers can tell "gave up" from "failed".
    pub(crate) fn operation(operation: &'static str, cluster: &str, source: BackendError) -> Self {
        if source.is_cancelled() {
            Self::Backend(source)
        } else {
            Self::Operation {
                operation,
                cluster: cluster.to_owned(),
                source,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Cancelled))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Operation { source, .. } | Self::Backend(source) => source.is_timeout(),
            _ => false,
        }
    }

    /// The backend error at the root of this error, if any
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Operation { source, .. } | Self::Backend(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ValidationError> for ClusterError {
    fn from(err: ValidationError) -> Self {
        Self::Validation {
            field: err.field,
            reason: err.reason,
        }
    }
}

impl From<MetaError> for ClusterError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NotFound(name) => Self::NotFound(name),
            MetaError::Locked { name, path } => Self::Locked { name, path },
            other => Self::Store(other),
        }
    }
}

/// Errors raised by an execution backend
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The caller cancelled a blocking operation
    #[error("operation cancelled")]
    Cancelled,
    /// A readiness wait exceeded its deadline
    #[error("timeout waiting for cluster to become healthy during {operation} (waited {}s)", waited.as_secs())]
    Timeout {
        operation: &'static str,
        waited: Duration,
    },
    /// The container engine or Kubernetes API cannot be reached
    #[error("{what} is unavailable: {hint}")]
    Unavailable { what: String, hint: String },
    /// The Milvus custom resource definition is not installed
    #[error("Milvus operator is not installed (CRD {crd} not found). Install it with: {install}")]
    OperatorMissing { crd: String, install: String },
    #[error("{operation} is not supported by the {backend} backend: {reason}")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
        reason: &'static str,
    },
    #[error("{0} is not implemented for custom resource deployments")]
    NotImplemented(&'static str),
    #[error("cluster is already running version {0}")]
    SameVersion(String),
    #[error("component '{component}' is not valid here: {reason}")]
    InvalidComponent { component: String, reason: String },
    #[error("invalid custom resource: {0}")]
    InvalidResource(String),
    #[error("Milvus resource '{name}' not found in namespace '{namespace}'")]
    ResourceNotFound { name: String, namespace: String },
    #[error("Milvus resource '{name}' already exists in namespace '{namespace}'")]
    ResourceExists { name: String, namespace: String },
    #[error("command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("Kubernetes config error: {0}")]
    K8Config(#[from] K8ConfigError),
    #[error("Kubernetes client error: {0:#}")]
    K8Client(#[source] AnyError),
    #[error("{0}: {kind}", kind = .0.source)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
