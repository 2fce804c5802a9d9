//! Single-host backend driving `docker compose`.
//!
//! Only standalone Milvus is supported here; the rendered project runs etcd,
//! MinIO and one Milvus container, plus Prometheus and Grafana on request.

pub mod compose;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use fluvio_command::CommandExt;
use fluvio_future::timer::sleep;
use futures_util::future::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::BackendError;
use crate::component::{Component, ScaleOptions};
use crate::config_map::{self, ConfigMap, deep_merge};
use crate::diagnose::{
    self, DependencyEndpoint, DiagnoseResult, ObservedCondition, ObservedStatus, ReplicaStatus,
};
use crate::meta::{BackendType, normalize_version};
use crate::topology::Topology;

use self::compose::{
    ComposeFile, ComposeParams, ContainerState, ETCD_SERVICE, MILVUS_SERVICE, MINIO_SERVICE,
    parse_ps, prometheus_config,
};
use super::{BackendContext, command_output};

const COMPOSE_FILE: &str = "docker-compose.yml";
const USER_CONFIG_FILE: &str = "user.yaml";
const PROMETHEUS_FILE: &str = "prometheus.yml";
const COMPOSE_LOG_FILE: &str = "compose.log";

/// how often a blocking compose call is checked for completion or cancellation
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOG_TAIL_ON_FAILURE: usize = 20;

#[derive(Debug)]
pub struct LocalBackend {
    project: String,
    version: String,
    topology: Topology,
    with_monitor: bool,
    deploy_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(context: BackendContext) -> Self {
        let deploy_dir = context.resolve(&context.topology.global.deploy_dir);
        let data_dir = context.resolve(&context.topology.global.data_dir);
        let log_dir = context.resolve(&context.topology.global.log_dir);
        Self {
            project: context.meta.name,
            version: context.meta.version,
            with_monitor: context.meta.with_monitor,
            topology: context.topology,
            deploy_dir,
            data_dir,
            log_dir,
        }
    }

    fn compose_path(&self) -> PathBuf {
        self.deploy_dir.join(COMPOSE_FILE)
    }

    fn user_config_path(&self) -> PathBuf {
        self.deploy_dir.join(USER_CONFIG_FILE)
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(&self.project)
            .arg("-f")
            .arg(self.compose_path());
        cmd
    }

    fn render(&self, version: &str) -> ComposeFile {
        ComposeFile::render(&ComposeParams {
            project: &self.project,
            version,
            topology: &self.topology,
            data_dir: &self.data_dir,
            deploy_dir: &self.deploy_dir,
            with_monitor: self.with_monitor,
        })
    }

    fn write_compose(&self, compose: &ComposeFile) -> Result<(), BackendError> {
        let contents = serde_yaml::to_string(compose)?;
        fs::write(self.compose_path(), contents)?;
        Ok(())
    }

    fn read_compose(&self) -> Result<ComposeFile, BackendError> {
        let contents = fs::read_to_string(self.compose_path())?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Puts back a compose file rendered before a failed change
    fn restore_compose(&self, previous: &str) {
        match fs::write(self.compose_path(), previous) {
            Ok(()) => info!(path = %self.compose_path().display(), "restored previous compose file"),
            Err(err) => warn!(%err, "unable to restore previous compose file"),
        }
    }

    /// Writes the compose project, the user config and bind mount directories
    fn prepare(&self) -> Result<(), BackendError> {
        for dir in [&self.deploy_dir, &self.log_dir] {
            fs::create_dir_all(dir)?;
        }
        for service in [ETCD_SERVICE, MINIO_SERVICE, "milvus"] {
            fs::create_dir_all(self.data_dir.join(service))?;
        }

        self.write_compose(&self.render(&self.version))?;

        let user_config = self.user_config_path();
        if !user_config.exists() {
            let initial = self
                .topology
                .primary()
                .map(|server| server.config.clone())
                .unwrap_or_default();
            config_map::save_yaml(&user_config, &initial)?;
        }
        if self.with_monitor {
            fs::write(self.deploy_dir.join(PROMETHEUS_FILE), prometheus_config())?;
        }
        Ok(())
    }

    /// Runs a compose command that may block for minutes, killing it on cancellation
    async fn run_blocking(
        &self,
        cmd: &mut Command,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let log_path = self.log_dir.join(COMPOSE_LOG_FILE);
        let outputs = File::create(&log_path)?;
        let errors = outputs.try_clone()?;
        let command = cmd.display();
        info!(cmd = %command, "Invoking command");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(outputs))
            .stderr(Stdio::from(errors))
            .spawn()?;

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                return Err(BackendError::CommandFailed {
                    command,
                    output: tail_file(&log_path, LOG_TAIL_ON_FAILURE),
                });
            }
            if cancel.is_cancelled() {
                warn!(cmd = %command, "cancelled, killing child process");
                if let Err(err) = child.kill() {
                    debug!(%err, "child already exited");
                }
                if let Err(err) = child.wait() {
                    warn!(cmd = %command, %err, "unable to reap child process");
                }
                return Err(BackendError::Cancelled);
            }
            select(pin!(sleep(CHILD_POLL_INTERVAL)), pin!(cancel.cancelled())).await;
        }
    }

    fn run(&self, cmd: &mut Command) -> Result<String, BackendError> {
        let output = cmd.log().result()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn containers(&self) -> Result<Vec<ContainerState>, BackendError> {
        let output = self.run(self.compose().args(["ps", "-a", "--format", "json"]))?;
        Ok(parse_ps(&output)?)
    }

    fn observe(&self) -> Result<ObservedStatus, BackendError> {
        let containers = self.containers()?;
        let milvus = containers.iter().find(|c| c.service == MILVUS_SERVICE);
        let stopped = !containers.is_empty() && containers.iter().all(|c| !c.is_running());

        let mut components = BTreeMap::new();
        let mut conditions = vec![];
        for container in &containers {
            if container.service == MILVUS_SERVICE {
                let entry: &mut ReplicaStatus =
                    components.entry(container.service.clone()).or_default();
                if !stopped {
                    entry.desired += 1;
                }
                if container.is_ready() {
                    entry.ready += 1;
                }
            } else if !stopped {
                // supporting services surface as conditions
                conditions.push(ObservedCondition {
                    kind: format!("{}Ready", container.service),
                    status: if container.is_ready() { "True" } else { "False" }.to_owned(),
                    reason: container.state.clone(),
                    message: container.health.clone(),
                });
            }
        }

        let all_ready = !containers.is_empty() && containers.iter().all(ContainerState::is_ready);
        let status = if all_ready {
            diagnose::HEALTHY
        } else if stopped {
            "Stopped"
        } else {
            "Unhealthy"
        };

        let etcd_port = self
            .topology
            .etcd_servers
            .first()
            .map(|etcd| etcd.client_port)
            .unwrap_or(crate::topology::DEFAULT_ETCD_CLIENT_PORT);
        let minio_port = self
            .topology
            .minio_servers
            .first()
            .map(|minio| minio.port)
            .unwrap_or(crate::topology::DEFAULT_MINIO_PORT);

        Ok(ObservedStatus {
            status: status.to_owned(),
            endpoint: milvus
                .and_then(|c| c.published(19530))
                .map(|port| format!("localhost:{port}")),
            components,
            conditions,
            dependencies: vec![
                DependencyEndpoint {
                    name: ETCD_SERVICE.to_owned(),
                    target: format!("{ETCD_SERVICE}:{etcd_port}"),
                },
                DependencyEndpoint {
                    name: MINIO_SERVICE.to_owned(),
                    target: format!("{MINIO_SERVICE}:{minio_port}"),
                },
            ],
            resources: vec![],
            stopped,
        })
    }

    async fn up(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_blocking(self.compose().args(["up", "-d", "--wait"]), cancel)
            .await
    }
}

/// Last lines of a log file, for error messages
fn tail_file(path: &Path, lines: usize) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let all: Vec<&str> = contents.lines().collect();
            all[all.len().saturating_sub(lines)..].join("\n")
        }
        Err(err) => format!("<unable to read {}: {err}>", path.display()),
    }
}

#[async_trait]
impl super::ClusterBackend for LocalBackend {
    fn kind(&self) -> BackendType {
        BackendType::Local
    }

    #[instrument(skip(self, cancel), fields(project = %self.project))]
    async fn deploy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.prepare()?;
        self.up(cancel).await?;
        info!(project = %self.project, "local cluster is up");
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(project = %self.project))]
    async fn start(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_blocking(self.compose().arg("start"), cancel).await
    }

    #[instrument(skip(self, cancel), fields(project = %self.project))]
    async fn stop(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.run_blocking(self.compose().arg("stop"), cancel).await
    }

    #[instrument(skip(self, cancel), fields(project = %self.project))]
    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        if !self.compose_path().exists() {
            debug!("no compose file, nothing to tear down");
            return Ok(());
        }
        self.run_blocking(
            self.compose().args(["down", "--volumes", "--remove-orphans"]),
            cancel,
        )
        .await
    }

    async fn status(&self, _cancel: &CancellationToken) -> Result<String, BackendError> {
        let containers = self.containers()?;
        let running = containers.iter().filter(|c| c.is_running()).count();
        let status = match running {
            0 => "Stopped".to_owned(),
            n if n == containers.len() => "Running".to_owned(),
            n => format!("Degraded ({n}/{} services running)", containers.len()),
        };
        Ok(status)
    }

    async fn is_running(&self, _cancel: &CancellationToken) -> bool {
        match self.containers() {
            Ok(containers) => containers
                .iter()
                .any(|c| c.service == MILVUS_SERVICE && c.is_running()),
            Err(err) => {
                debug!(%err, "unable to query containers");
                false
            }
        }
    }

    async fn logs(
        &self,
        cancel: &CancellationToken,
        service: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, BackendError> {
        let mut cmd = self.compose();
        cmd.args(["logs", "--no-color", "--tail"])
            .arg(tail_lines.to_string());
        if let Some(service) = service {
            cmd.arg(service);
        }
        command_output(cmd, cancel).await
    }

    async fn scale(
        &self,
        _cancel: &CancellationToken,
        _component: Component,
        _options: &ScaleOptions,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            operation: "scale",
            backend: "local",
            reason: "local deployments run a single standalone instance",
        })
    }

    async fn replicas(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i32>, BackendError> {
        let running = self
            .containers()?
            .iter()
            .any(|c| c.service == MILVUS_SERVICE && c.is_running());
        Ok(BTreeMap::from([(
            Component::Standalone.name().to_owned(),
            i32::from(running),
        )]))
    }

    #[instrument(skip(self, cancel), fields(project = %self.project))]
    async fn upgrade(&self, cancel: &CancellationToken, version: &str) -> Result<(), BackendError> {
        let version = normalize_version(version);
        let previous = fs::read_to_string(self.compose_path())?;
        let mut compose: ComposeFile = serde_yaml::from_str(&previous)?;
        if compose.milvus_version() == Some(version.as_str()) {
            return Err(BackendError::SameVersion(version));
        }
        compose.set_milvus_version(&version);
        self.write_compose(&compose)?;
        info!(%version, "recreating standalone with new image");
        if let Err(err) = self.up(cancel).await {
            self.restore_compose(&previous);
            return Err(err);
        }
        Ok(())
    }

    async fn version(&self, _cancel: &CancellationToken) -> Result<String, BackendError> {
        let compose = self.read_compose()?;
        compose
            .milvus_version()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::InvalidResource("compose file has no Milvus image tag".to_owned()))
    }

    async fn config(&self, _cancel: &CancellationToken) -> Result<ConfigMap, BackendError> {
        config_map::load_yaml(&self.user_config_path())
    }

    #[instrument(skip(self, cancel, config), fields(project = %self.project))]
    async fn set_config(
        &self,
        cancel: &CancellationToken,
        config: ConfigMap,
    ) -> Result<(), BackendError> {
        let path = self.user_config_path();
        let mut current = config_map::load_yaml(&path)?;
        deep_merge(&mut current, config);
        config_map::save_yaml(&path, &current)?;

        self.run_blocking(self.compose().args(["restart", MILVUS_SERVICE]), cancel)
            .await?;
        self.up(cancel).await
    }

    async fn diagnose(&self, _cancel: &CancellationToken) -> Result<DiagnoseResult, BackendError> {
        match self.observe() {
            Ok(observed) => Ok(diagnose::classify(&observed)),
            Err(err) => Ok(DiagnoseResult::unreachable(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::ClusterBackend;
    use crate::meta::ClusterMeta;

    use super::*;

    fn backend(dir: &Path) -> LocalBackend {
        let mut topology = Topology::standalone();
        topology.primary_mut().expect("server").config =
            serde_json::from_str(r#"{"log": {"level": "debug"}}"#).expect("config");
        LocalBackend::new(BackendContext {
            meta: ClusterMeta::new("dev", BackendType::Local, "2.5.4"),
            topology,
            cluster_dir: dir.to_owned(),
        })
    }

    #[test]
    fn test_prepare_writes_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend.prepare().expect("prepare");

        let compose = backend.read_compose().expect("compose");
        assert_eq!(compose.milvus_version(), Some("v2.5.4"));
        assert!(dir.path().join("data/etcd").is_dir());
        assert!(dir.path().join("logs").is_dir());

        let user = config_map::load_yaml(&backend.user_config_path()).expect("user config");
        assert_eq!(user["log"]["level"], "debug");
    }

    #[fluvio_future::test]
    async fn test_scale_unsupported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        let err = backend
            .scale(
                &CancellationToken::new(),
                Component::Standalone,
                &ScaleOptions::replicas(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { operation: "scale", .. }));
    }

    #[fluvio_future::test]
    async fn test_version_and_config_from_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend.prepare().expect("prepare");
        let cancel = CancellationToken::new();

        assert_eq!(backend.version(&cancel).await.expect("version"), "v2.5.4");
        let config = backend.config(&cancel).await.expect("config");
        assert_eq!(config["log"]["level"], "debug");
    }

    #[fluvio_future::test]
    async fn test_cancelled_before_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.up(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[fluvio_future::test]
    async fn test_failed_upgrade_keeps_previous_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend.prepare().expect("prepare");
        let before = fs::read_to_string(backend.compose_path()).expect("compose");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.upgrade(&cancel, "2.6.0").await.unwrap_err();
        assert!(err.is_cancelled());

        let compose = backend.read_compose().expect("compose");
        assert_eq!(compose.milvus_version(), Some("v2.5.4"));
        assert_eq!(fs::read_to_string(backend.compose_path()).expect("compose"), before);
    }

    #[fluvio_future::test]
    async fn test_upgrade_to_same_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend.prepare().expect("prepare");
        let err = backend
            .upgrade(&CancellationToken::new(), "2.5.4")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SameVersion(version) if version == "v2.5.4"));
    }

    #[fluvio_future::test]
    async fn test_logs_honor_cancellation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.logs(&cancel, None, 10).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[fluvio_future::test]
    async fn test_destroy_without_project_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend
            .destroy(&CancellationToken::new())
            .await
            .expect("destroy");
    }

    #[test]
    fn test_tail_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        fs::write(&path, "one\ntwo\nthree\n").expect("write");
        assert_eq!(tail_file(&path, 2), "two\nthree");
        assert!(tail_file(&dir.path().join("missing"), 2).starts_with("<unable"));
    }
}
