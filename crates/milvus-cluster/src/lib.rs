#![deny(rustdoc::broken_intra_doc_links)]

//! Lifecycle management for Milvus clusters.
//!
//! A cluster is described by a declarative [`Topology`], deployed through one of
//! two execution backends (docker compose on a single host, or the Milvus
//! operator on Kubernetes) and tracked by a [`ClusterMeta`] record on disk.
//! [`ClusterManager`] is the only entry point; callers never talk to a backend
//! directly.
//!
//! ```no_run
//! # async fn run() -> Result<(), milvus_cluster::ClusterError> {
//! use milvus_cluster::{CancellationToken, ClusterManager, DeployOptions, ManagerConfig};
//!
//! let manager = ClusterManager::new(ManagerConfig::default());
//! let cancel = CancellationToken::new();
//! let options = DeployOptions::builder().version("2.5.4").build()?;
//! manager.deploy("dev", None, options, &cancel).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod manager;

pub mod backend;
pub mod check;
pub mod component;
pub mod config_map;
pub mod diagnose;
pub mod meta;
pub mod topology;

pub use error::{BackendError, ClusterError};
pub use manager::{ClusterInfo, ClusterManager, DeployOptions, DeployOptionsBuilder};
pub use manager::{ManagerConfig, ManagerConfigBuilder};
pub use backend::{BackendContext, BackendFactory, ClusterBackend, DefaultBackendFactory};
pub use check::{ClusterChecker, CheckStatus, CheckStatuses, CheckResult, CheckSuggestion};
pub use component::{Component, ComponentSpec, ResourceSpec, ScaleOptions};
pub use config_map::{ConfigMap, deep_merge};
pub use diagnose::{DiagnoseResult, Issue, Severity};
pub use meta::{BackendType, ClusterMeta, ClusterStatus, KubernetesConnection, MetaStore};
pub use topology::{DeployMode, Topology, ValidationError};

pub use tokio_util::sync::CancellationToken;

/// Namespace used when neither the topology nor the caller names one
pub const DEFAULT_NAMESPACE: &str = "milvus";

/// Milvus release deployed when the caller does not ask for a version
pub const DEFAULT_MILVUS_VERSION: &str = "v2.5.4";

/// Container image repository for Milvus server images
pub const MILVUS_IMAGE_REPO: &str = "milvusdb/milvus";

/// Environment variable that relocates all per-cluster state
pub const HOME_ENV: &str = "MILVUS_CTL_HOME";
