use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendContext, BackendFactory, ClusterBackend, DefaultBackendFactory};
use crate::check::{ClusterCheckError, ClusterChecker};
use crate::component::{Component, ScaleOptions};
use crate::config_map::ConfigMap;
use crate::diagnose::DiagnoseResult;
use crate::meta::{
    BackendType, ClusterLock, ClusterMeta, ClusterStatus, KubernetesConnection, MetaStore,
    normalize_version,
};
use crate::topology::{DeployMode, Topology, ValidationError};
use crate::{BackendError, ClusterError, DEFAULT_MILVUS_VERSION, HOME_ENV};

const DEFAULT_HOME_DIR: &str = ".milvus-ctl";
const CUSTOM_RESOURCE_FILE: &str = "milvus-resource.yaml";
const MAX_NAME_LEN: usize = 63;

/// Where cluster state lives when nothing else is configured
fn default_base_dir() -> PathBuf {
    let from_env = env::var(HOME_ENV).unwrap_or_default();
    if !from_env.is_empty() {
        return PathBuf::from(from_env);
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(DEFAULT_HOME_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_DIR))
}

/// Settings shared by every operation of a [`ClusterManager`]
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct ManagerConfig {
    /// Root of all per-cluster state.
    ///
    /// Defaults to `$MILVUS_CTL_HOME`, or `~/.milvus-ctl`.
    ///
    /// # Example
    ///
    /// ```
    /// # use milvus_cluster::{ClusterError, ManagerConfig};
    /// # fn example() -> Result<(), ClusterError> {
    /// let config = ManagerConfig::builder()
    ///     .base_dir("/var/lib/milvus-ctl")
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[builder(setter(into), default = "default_base_dir()")]
    base_dir: PathBuf,

    /// Milvus version deployed when the caller does not name one
    #[builder(setter(into), default = "DEFAULT_MILVUS_VERSION.to_owned()")]
    default_version: String,
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn default_version(&self) -> &str {
        &self.default_version
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            default_version: DEFAULT_MILVUS_VERSION.to_owned(),
        }
    }
}

impl ManagerConfigBuilder {
    /// Creates a `ManagerConfig` with the current configuration.
    pub fn build(&self) -> Result<ManagerConfig, ClusterError> {
        self.build_impl().map_err(|err| ClusterError::Validation {
            field: "manager config".to_owned(),
            reason: err.to_string(),
        })
    }
}

/// Caller choices for a new deployment
#[derive(Builder, Debug, Clone, Default)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct DeployOptions {
    /// Milvus version, with or without the leading `v`
    #[builder(setter(into, strip_option), default)]
    pub version: Option<String>,

    #[builder(default)]
    pub backend: BackendType,

    /// Kubernetes namespace; overrides `global.namespace` of the topology
    #[builder(setter(into, strip_option), default)]
    pub namespace: Option<String>,

    #[builder(setter(into, strip_option), default)]
    pub kubeconfig_path: Option<PathBuf>,

    /// kubeconfig context to use instead of the current one
    #[builder(setter(into, strip_option), default)]
    pub context: Option<String>,

    /// Adds Prometheus and Grafana (local) or enables metrics (Kubernetes)
    #[builder(default)]
    pub with_monitor: bool,

    /// Set by interactive callers once the user confirmed; not consulted here
    #[builder(default)]
    pub skip_confirm: bool,

    #[builder(default)]
    pub skip_checks: bool,

    /// User-authored `Milvus` document deployed as written
    #[builder(setter(into, strip_option), default)]
    pub custom_resource: Option<PathBuf>,
}

impl DeployOptions {
    /// # Example
    ///
    /// ```
    /// # use milvus_cluster::{BackendType, ClusterError, DeployOptions};
    /// # fn example() -> Result<(), ClusterError> {
    /// let options = DeployOptions::builder()
    ///     .version("2.5.5")
    ///     .backend(BackendType::Kubernetes)
    ///     .namespace("vectors")
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> DeployOptionsBuilder {
        DeployOptionsBuilder::default()
    }
}

impl DeployOptionsBuilder {
    pub fn build(&self) -> Result<DeployOptions, ClusterError> {
        self.build_impl().map_err(|err| ClusterError::Validation {
            field: "deploy options".to_owned(),
            reason: err.to_string(),
        })
    }
}

/// What `display` reports about one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterInfo {
    pub meta: ClusterMeta,
    pub topology: Topology,
}

/// Cluster names become directory, compose project and Kubernetes object
/// names, so they follow DNS label rules
fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = !name.starts_with('-') && !name.ends_with('-');
    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars || !valid_ends {
        return Err(ValidationError::new(
            "name",
            format!(
                "'{name}' must be 1-{MAX_NAME_LEN} lowercase letters, digits or '-', starting and ending with a letter or digit"
            ),
        ));
    }
    Ok(())
}

/// State held while a mutating operation runs
struct Mutation {
    meta: ClusterMeta,
    topology: Topology,
    previous: ClusterStatus,
    backend: Box<dyn ClusterBackend>,
    _lock: ClusterLock,
}

/// Single entry point for every lifecycle operation
#[derive(Debug)]
pub struct ClusterManager {
    config: ManagerConfig,
    store: MetaStore,
    factory: Box<dyn BackendFactory>,
}

impl ClusterManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_factory(config, DefaultBackendFactory)
    }

    /// Uses a custom way of building backends
    pub fn with_factory(config: ManagerConfig, factory: impl BackendFactory + 'static) -> Self {
        let store = MetaStore::new(config.base_dir());
        Self {
            config,
            store,
            factory: Box::new(factory),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn context(&self, meta: &ClusterMeta, topology: &Topology) -> BackendContext {
        BackendContext {
            meta: meta.clone(),
            topology: topology.clone(),
            cluster_dir: self.store.cluster_dir(&meta.name),
        }
    }

    fn require_exists(&self, name: &str) -> Result<(), ClusterError> {
        validate_name(name)?;
        if self.store.exists(name) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(name.to_owned()))
        }
    }

    /// Loads the record and builds its backend for a read-only operation
    fn open(&self, name: &str) -> Result<(ClusterMeta, Box<dyn ClusterBackend>), ClusterError> {
        self.require_exists(name)?;
        let meta = self.store.load(name)?;
        let topology = self.store.load_topology(name)?;
        let backend = self
            .factory
            .create(self.context(&meta, &topology))
            .map_err(|err| ClusterError::operation("connect to", name, err))?;
        Ok((meta, backend))
    }

    /// Locks the cluster, builds its backend and records the in-progress status
    fn begin(
        &self,
        name: &str,
        operation: &'static str,
        in_progress: Option<ClusterStatus>,
    ) -> Result<Mutation, ClusterError> {
        self.require_exists(name)?;
        let lock = self.store.lock(name)?;
        let mut meta = self.store.load(name)?;
        let topology = self.store.load_topology(name)?;
        let backend = self
            .factory
            .create(self.context(&meta, &topology))
            .map_err(|err| ClusterError::operation(operation, name, err))?;

        let previous = meta.status;
        if let Some(status) = in_progress {
            meta.status = status;
            self.store.update(&mut meta)?;
            info!(cluster = name, %status, "operation started");
        }

        Ok(Mutation {
            meta,
            topology,
            previous,
            backend,
            _lock: lock,
        })
    }

    /// Records the outcome of a backend call: the terminal status on success,
    /// the pre-operation status on failure
    fn finish(
        &self,
        mutation: &mut Mutation,
        operation: &'static str,
        result: Result<(), BackendError>,
        terminal: ClusterStatus,
    ) -> Result<(), ClusterError> {
        match result {
            Ok(()) => {
                mutation.meta.status = terminal;
                self.store.update(&mut mutation.meta)?;
                info!(cluster = %mutation.meta.name, operation, status = %terminal, "operation complete");
                Ok(())
            }
            Err(err) => {
                if mutation.meta.status != mutation.previous {
                    mutation.meta.status = mutation.previous;
                    if let Err(store_err) = self.store.update(&mut mutation.meta) {
                        warn!(cluster = %mutation.meta.name, %store_err, "unable to restore status");
                    }
                }
                Err(ClusterError::operation(operation, &mutation.meta.name, err))
            }
        }
    }

    async fn preflight(
        &self,
        backend: BackendType,
        connection: Option<&KubernetesConnection>,
    ) -> Result<(), ClusterError> {
        let checker = match (backend, connection) {
            (BackendType::Kubernetes, Some(connection)) => {
                ClusterChecker::empty().with_k8_checks(connection)
            }
            _ => ClusterChecker::empty().with_local_checks(),
        };
        match checker.run_and_require_pass().await {
            Ok(statuses) => {
                debug!(checks = statuses.len(), "preflight checks passed");
                Ok(())
            }
            Err(ClusterCheckError::PreCheckFlightFailure(failures)) => {
                Err(ClusterError::Precheck(failures))
            }
            Err(err) => Err(ClusterError::Precheck(err.to_string())),
        }
    }

    /// Deploys a new cluster and blocks until it is ready.
    ///
    /// Without a topology file a single-host standalone topology is used.
    /// A failed deployment keeps its record with status `Unknown` so it can be
    /// inspected and destroyed.
    #[instrument(skip(self, options, cancel))]
    pub async fn deploy(
        &self,
        name: &str,
        topology_path: Option<&Path>,
        options: DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<ClusterMeta, ClusterError> {
        validate_name(name)?;
        if self.store.exists(name) {
            return Err(ClusterError::AlreadyExists(name.to_owned()));
        }

        let mut topology = match topology_path {
            Some(path) => Topology::load(path)?,
            None => Topology::standalone(),
        };
        if let Some(namespace) = &options.namespace {
            topology.global.namespace = namespace.clone();
        }
        topology.apply_defaults();
        topology.validate()?;
        let mode = topology.deploy_mode()?;

        if options.backend == BackendType::Local && mode == DeployMode::Distributed {
            return Err(ValidationError::new(
                "milvus_servers[0].mode",
                "the local backend only runs standalone Milvus",
            )
            .into());
        }
        if options.backend == BackendType::Local && options.custom_resource.is_some() {
            return Err(ValidationError::new(
                "custom_resource",
                "custom resources require the kubernetes backend",
            )
            .into());
        }
        let custom_resource = match &options.custom_resource {
            Some(path) => Some(fs::read_to_string(path)?),
            None => None,
        };

        let version = normalize_version(
            options
                .version
                .as_deref()
                .unwrap_or(self.config.default_version()),
        );
        let mut meta = ClusterMeta::new(name, options.backend, &version);
        meta.mode = mode;
        meta.port = topology.milvus_port();
        meta.metrics_port = topology.metrics_port();
        meta.with_monitor = options.with_monitor || topology.has_monitoring();
        if options.backend == BackendType::Kubernetes {
            meta.kubernetes = Some(KubernetesConnection {
                config_path: options.kubeconfig_path.clone(),
                context: options.context.clone(),
                namespace: topology.global.namespace.clone(),
            });
        }

        if !options.skip_checks {
            self.preflight(options.backend, meta.kubernetes.as_ref())
                .await?;
        }

        let cluster_dir = self.store.create_dir(name)?;
        let lock = self.store.lock(name)?;
        if let Some(document) = custom_resource {
            let path = cluster_dir.join(CUSTOM_RESOURCE_FILE);
            fs::write(&path, document)?;
            meta.custom_resource = Some(path);
        }
        self.store.save_topology(name, &topology)?;
        self.store.save(&meta)?;
        info!(cluster = name, backend = %meta.backend, version = %meta.version, "deploying");

        let backend = match self.factory.create(self.context(&meta, &topology)) {
            Ok(backend) => backend,
            Err(err) => {
                drop(lock);
                if let Err(store_err) = self.store.remove(name) {
                    warn!(cluster = name, %store_err, "unable to remove cluster record");
                }
                return Err(ClusterError::operation("deploy", name, err));
            }
        };

        match backend.deploy(cancel).await {
            Ok(()) => {
                meta.status = ClusterStatus::Running;
                self.store.update(&mut meta)?;
                info!(cluster = name, "cluster is running");
                Ok(meta)
            }
            Err(err) => {
                meta.status = ClusterStatus::Unknown;
                if let Err(store_err) = self.store.update(&mut meta) {
                    warn!(cluster = name, %store_err, "unable to record failed deployment");
                }
                Err(ClusterError::operation("deploy", name, err))
            }
        }
    }

    #[instrument(skip(self, cancel))]
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<(), ClusterError> {
        let mut mutation = self.begin(name, "start", None)?;
        let result = mutation.backend.start(cancel).await;
        self.finish(&mut mutation, "start", result, ClusterStatus::Running)
    }

    #[instrument(skip(self, cancel))]
    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<(), ClusterError> {
        let mut mutation = self.begin(name, "stop", None)?;
        let result = mutation.backend.stop(cancel).await;
        self.finish(&mut mutation, "stop", result, ClusterStatus::Stopped)
    }

    /// Changes replicas and/or resources of one component.
    ///
    /// The request is checked before anything is loaded; on success the new
    /// shape is written back into the stored topology.
    #[instrument(skip(self, options, cancel))]
    pub async fn scale(
        &self,
        name: &str,
        component: &str,
        options: ScaleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        options.validate()?;
        let component: Component = component.parse()?;

        let mut mutation = self.begin(name, "scale", Some(ClusterStatus::Scaling))?;
        let result = mutation.backend.scale(cancel, component, &options).await;
        if result.is_ok() {
            if let Some(server) = mutation.topology.primary_mut() {
                server.component_mut(component).apply_scale(&options);
                if let Err(err) = self.store.save_topology(name, &mutation.topology) {
                    warn!(cluster = name, %err, "unable to record scaled topology");
                }
            }
        }
        self.finish(&mut mutation, "scale", result, ClusterStatus::Running)
    }

    #[instrument(skip(self, cancel))]
    pub async fn upgrade(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        let version = normalize_version(version);
        let mut mutation = self.begin(name, "upgrade", Some(ClusterStatus::Upgrading))?;
        let result = mutation.backend.upgrade(cancel, &version).await;
        if result.is_ok() {
            mutation.meta.version = version;
        }
        self.finish(&mut mutation, "upgrade", result, ClusterStatus::Running)
    }

    /// Deep-merges `config` into the running configuration
    #[instrument(skip(self, config, cancel))]
    pub async fn set_config(
        &self,
        name: &str,
        config: ConfigMap,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        let mut mutation = self.begin(name, "set config", None)?;
        let result = mutation.backend.set_config(cancel, config).await;
        self.finish(&mut mutation, "set config", result, ClusterStatus::Running)
    }

    pub async fn get_config(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ConfigMap, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .config(cancel)
            .await
            .map_err(|err| ClusterError::operation("read config of", name, err))
    }

    /// Tears the cluster down and deletes its record.
    ///
    /// With `force` a backend failure is logged and the record removed
    /// anyway; cancellation is always returned.
    #[instrument(skip(self, cancel))]
    pub async fn destroy(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        self.require_exists(name)?;
        let lock = self.store.lock(name)?;
        let meta = self.store.load(name)?;
        let topology = self.store.load_topology(name)?;

        let result = match self.factory.create(self.context(&meta, &topology)) {
            Ok(backend) => backend.destroy(cancel).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => return Err(ClusterError::Backend(err)),
            Err(err) if force => {
                warn!(cluster = name, %err, "destroy failed, removing record anyway");
            }
            Err(err) => return Err(ClusterError::operation("destroy", name, err)),
        }

        drop(lock);
        self.store.remove(name)?;
        info!(cluster = name, "cluster destroyed");
        Ok(())
    }

    /// Persisted record and topology of one cluster
    pub fn display(&self, name: &str) -> Result<ClusterInfo, ClusterError> {
        self.require_exists(name)?;
        Ok(ClusterInfo {
            meta: self.store.load(name)?,
            topology: self.store.load_topology(name)?,
        })
    }

    /// Every recorded cluster, with status replaced by what the backend
    /// reports right now. Nothing is written back.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ClusterMeta>, ClusterError> {
        let mut clusters = vec![];
        for name in self.store.list()? {
            let mut meta = match self.store.load(&name) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(cluster = %name, %err, "skipping unreadable cluster record");
                    continue;
                }
            };
            let live = match self.store.load_topology(&name) {
                Ok(topology) => match self.factory.create(self.context(&meta, &topology)) {
                    Ok(backend) => Some(backend.is_running(cancel).await),
                    Err(err) => {
                        warn!(cluster = %name, %err, "unable to probe cluster");
                        None
                    }
                },
                Err(err) => {
                    warn!(cluster = %name, %err, "unable to load topology");
                    None
                }
            };
            if let Some(running) = live {
                meta.status = if running {
                    ClusterStatus::Running
                } else {
                    ClusterStatus::Stopped
                };
            }
            clusters.push(meta);
        }
        Ok(clusters)
    }

    pub async fn logs(
        &self,
        name: &str,
        service: Option<&str>,
        tail_lines: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .logs(cancel, service, tail_lines)
            .await
            .map_err(|err| ClusterError::operation("read logs of", name, err))
    }

    pub async fn diagnose(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DiagnoseResult, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .diagnose(cancel)
            .await
            .map_err(|err| ClusterError::operation("diagnose", name, err))
    }

    /// Status text as reported by the backend
    pub async fn status(&self, name: &str, cancel: &CancellationToken) -> Result<String, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .status(cancel)
            .await
            .map_err(|err| ClusterError::operation("read status of", name, err))
    }

    pub async fn replicas(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i32>, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .replicas(cancel)
            .await
            .map_err(|err| ClusterError::operation("read replicas of", name, err))
    }

    /// Version actually running, as opposed to the recorded one
    pub async fn version(&self, name: &str, cancel: &CancellationToken) -> Result<String, ClusterError> {
        let (_, backend) = self.open(name)?;
        backend
            .version(cancel)
            .await
            .map_err(|err| ClusterError::operation("read version of", name, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_names() {
        for name in ["dev", "milvus-1", "a", "0prod9"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
        for name in ["", "-dev", "dev-", "Dev", "my_cluster", "../etc", &"a".repeat(64)] {
            assert_eq!(validate_name(name).unwrap_err().field, "name", "{name}");
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::builder()
            .base_dir("/srv/milvus-ctl")
            .build()
            .expect("config");
        assert_eq!(config.base_dir(), Path::new("/srv/milvus-ctl"));
        assert_eq!(config.default_version(), DEFAULT_MILVUS_VERSION);
    }

    #[test]
    fn test_deploy_options_defaults() {
        let options = DeployOptions::builder()
            .version("2.5.5")
            .kubeconfig_path("/home/me/.kube/config")
            .build()
            .expect("options");
        assert_eq!(options.version.as_deref(), Some("2.5.5"));
        assert_eq!(options.backend, BackendType::Local);
        assert_eq!(
            options.kubeconfig_path,
            Some(PathBuf::from("/home/me/.kube/config"))
        );
        assert!(!options.skip_checks);
        assert!(options.namespace.is_none());
    }
}
