//! Execution backends.
//!
//! Every backend exposes the same operations over a different substrate.
//! Blocking calls take the caller's [`CancellationToken`] and must return
//! [`BackendError::Cancelled`] as soon as it fires.

pub mod k8;
pub mod local;

use std::collections::BTreeMap;
use std::env;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use fluvio_command::CommandExt;
use fluvio_future::task::spawn_blocking;
use futures_util::future::{Either, select};
use tokio_util::sync::CancellationToken;

use crate::BackendError;
use crate::component::{Component, ScaleOptions};
use crate::config_map::ConfigMap;
use crate::diagnose::DiagnoseResult;
use crate::meta::{BackendType, ClusterMeta};
use crate::topology::Topology;

pub use k8::{CustomResourceBackend, K8Backend};
pub use local::LocalBackend;

/// Reads a duration in seconds from the environment
pub(crate) fn env_secs(var: &str, default: u64) -> Duration {
    let var_value = env::var(var).unwrap_or_default();
    Duration::from_secs(var_value.parse().unwrap_or(default))
}

/// Runs a short command on the blocking pool and returns its stdout.
///
/// The caller gets [`BackendError::Cancelled`] as soon as the token fires;
/// the command itself is left to finish on the pool.
pub(crate) async fn command_output(
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<String, BackendError> {
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled);
    }
    let task = spawn_blocking(move || cmd.log().result());
    match select(pin!(task), pin!(cancel.cancelled())).await {
        Either::Left((output, _)) => Ok(String::from_utf8_lossy(&output?.stdout).into_owned()),
        Either::Right(_) => Err(BackendError::Cancelled),
    }
}

#[async_trait]
pub trait ClusterBackend: Debug + Send + Sync {
    fn kind(&self) -> BackendType;

    /// Creates the cluster and blocks until it is ready
    async fn deploy(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    async fn start(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    async fn stop(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Human readable status as reported by the substrate
    async fn status(&self, cancel: &CancellationToken) -> Result<String, BackendError>;

    async fn is_running(&self, cancel: &CancellationToken) -> bool;

    async fn logs(
        &self,
        cancel: &CancellationToken,
        service: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, BackendError>;

    async fn scale(
        &self,
        cancel: &CancellationToken,
        component: Component,
        options: &ScaleOptions,
    ) -> Result<(), BackendError>;

    async fn replicas(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i32>, BackendError>;

    async fn upgrade(&self, cancel: &CancellationToken, version: &str) -> Result<(), BackendError>;

    async fn version(&self, cancel: &CancellationToken) -> Result<String, BackendError>;

    async fn config(&self, cancel: &CancellationToken) -> Result<ConfigMap, BackendError>;

    async fn set_config(
        &self,
        cancel: &CancellationToken,
        config: ConfigMap,
    ) -> Result<(), BackendError>;

    async fn diagnose(&self, cancel: &CancellationToken) -> Result<DiagnoseResult, BackendError>;
}

/// Everything needed to construct the backend of an existing cluster
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub meta: ClusterMeta,
    pub topology: Topology,
    pub cluster_dir: PathBuf,
}

impl BackendContext {
    /// Resolves a topology directory relative to the cluster directory
    pub fn resolve(&self, dir: &str) -> PathBuf {
        let path = Path::new(dir);
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.cluster_dir.join(path)
        }
    }
}

/// Builds the backend recorded in a cluster's metadata
pub trait BackendFactory: Debug + Send + Sync {
    fn create(&self, context: BackendContext) -> Result<Box<dyn ClusterBackend>, BackendError>;
}

/// Selects local, Kubernetes or custom resource backends from the persisted record
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, context: BackendContext) -> Result<Box<dyn ClusterBackend>, BackendError> {
        match context.meta.backend {
            BackendType::Local => Ok(Box::new(LocalBackend::new(context))),
            BackendType::Kubernetes => {
                let backend = K8Backend::connect(&context)?;
                match context.meta.custom_resource.clone() {
                    Some(document) => Ok(Box::new(CustomResourceBackend::new(backend, document))),
                    None => Ok(Box::new(backend)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::meta::ClusterMeta;

    use super::*;

    #[test]
    fn test_local_backend_selected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = BackendContext {
            meta: ClusterMeta::new("dev", BackendType::Local, "v2.5.4"),
            topology: Topology::standalone(),
            cluster_dir: dir.path().to_owned(),
        };
        let backend = DefaultBackendFactory.create(context).expect("backend");
        assert_eq!(backend.kind(), BackendType::Local);
    }

    #[test]
    fn test_resolve_dirs() {
        let context = BackendContext {
            meta: ClusterMeta::new("dev", BackendType::Local, "v2.5.4"),
            topology: Topology::standalone(),
            cluster_dir: PathBuf::from("/state/clusters/dev"),
        };
        assert_eq!(context.resolve("data"), PathBuf::from("/state/clusters/dev/data"));
        assert_eq!(context.resolve("/srv/milvus"), PathBuf::from("/srv/milvus"));
    }

    #[fluvio_future::test]
    async fn test_command_output_returns_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("milvus");
        let output = command_output(cmd, &CancellationToken::new())
            .await
            .expect("echo");
        assert_eq!(output.trim(), "milvus");
    }

    #[fluvio_future::test]
    async fn test_command_output_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = command_output(Command::new("echo"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        fluvio_future::task::spawn(async move {
            fluvio_future::timer::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = command_output(cmd, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
