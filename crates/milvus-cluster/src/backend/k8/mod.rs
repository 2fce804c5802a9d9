//! Kubernetes backend driving a `Milvus` custom resource.
//!
//! The Milvus operator owns every pod and service; this backend only writes
//! the resource spec and polls the status the operator reports back.

mod client;
mod crd;
mod render;
mod wait;
pub mod resource;

#[cfg(test)]
pub(crate) mod fixture;

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8_types::{InputK8Obj, InputObjectMeta};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::BackendError;
use crate::backend::local::compose::{image_tag, milvus_image};
use crate::component::{Component, ComponentSpec, ScaleOptions};
use crate::config_map::{ConfigMap, deep_merge};
use crate::diagnose::{
    self, DependencyEndpoint, DiagnoseResult, ObservedCondition, ObservedStatus, ReplicaStatus,
    ResourceCheck,
};
use crate::meta::{BackendType, KubernetesConnection, normalize_version};
use crate::topology::{DEFAULT_ETCD_CLIENT_PORT, DEFAULT_MINIO_PORT, DEFAULT_REPLICAS, Topology};

use self::render::{INSTANCE_LABEL, mode_components, ownership_labels};
use self::resource::{
    Dependency, MilvusObj, MilvusSpec, MILVUS_CRD_NAME, ResourceRequirements,
};
use super::{BackendContext, ClusterBackend, command_output};

pub use self::client::{MilvusApi, load_client, load_config};
pub use self::crd::CustomResourceBackend;
pub use self::render::milvus_spec;
pub use self::wait::{WaitConfig, wait_until_healthy};

/// Manifest installing the Milvus operator and its CRD
pub const OPERATOR_MANIFEST: &str =
    "https://raw.githubusercontent.com/zilliztech/milvus-operator/main/deploy/manifests/deployment.yaml";

const PENDING: &str = "Pending";

pub(crate) fn operator_missing() -> BackendError {
    BackendError::OperatorMissing {
        crd: MILVUS_CRD_NAME.to_owned(),
        install: format!(
            "kubectl apply -f {OPERATOR_MANIFEST} (or: helm install milvus-operator milvus-operator/milvus-operator -n milvus-operator --create-namespace)"
        ),
    }
}

/// Whether a live spec describes a distributed deployment
fn is_cluster_mode(spec: &MilvusSpec) -> bool {
    matches!(spec.mode.as_deref(), Some("cluster") | Some("distributed"))
}

/// Components whose replicas are managed in the live spec's mode
fn managed_components(spec: &MilvusSpec) -> Vec<Component> {
    let distributed = is_cluster_mode(spec);
    let mut components = mode_components(distributed).to_vec();
    if distributed {
        components.extend(
            Component::OPTIONAL
                .into_iter()
                .filter(|component| spec.components.get(*component).is_some()),
        );
    }
    components
}

fn replicas_patch(replicas: impl IntoIterator<Item = (Component, i32)>) -> Value {
    let components: Map<String, Value> = replicas
        .into_iter()
        .map(|(component, count)| (component.spec_key().to_owned(), json!({ "replicas": count })))
        .collect();
    json!({ "spec": { "components": components } })
}

fn quantities(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn dependency_target(
    dependency: Option<&Dependency>,
    in_cluster_service: String,
) -> String {
    match dependency.filter(|dependency| dependency.external) {
        Some(external) => external
            .endpoint
            .clone()
            .unwrap_or_else(|| external.endpoints.join(",")),
        None => in_cluster_service,
    }
}

#[derive(Debug)]
pub struct K8Backend {
    name: String,
    namespace: String,
    version: String,
    with_monitor: bool,
    topology: Topology,
    connection: KubernetesConnection,
    api: Arc<dyn MilvusApi>,
    wait: WaitConfig,
}

impl K8Backend {
    /// Connects using the connection recorded for the cluster
    pub fn connect(context: &BackendContext) -> Result<Self, BackendError> {
        let connection = Self::connection(context);
        let api = load_client(&connection)?;
        Ok(Self::with_api(context, api))
    }

    pub fn with_api(context: &BackendContext, api: Arc<dyn MilvusApi>) -> Self {
        let connection = Self::connection(context);
        Self {
            name: context.meta.name.clone(),
            namespace: connection.namespace.clone(),
            version: context.meta.version.clone(),
            with_monitor: context.meta.with_monitor,
            topology: context.topology.clone(),
            connection,
            api,
            wait: WaitConfig::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    fn connection(context: &BackendContext) -> KubernetesConnection {
        context
            .meta
            .kubernetes
            .clone()
            .unwrap_or_else(|| KubernetesConnection {
                namespace: context.meta.namespace().to_owned(),
                ..Default::default()
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn api(&self) -> &dyn MilvusApi {
        self.api.as_ref()
    }

    pub(crate) fn target_version(&self) -> &str {
        &self.version
    }

    async fn fetch(&self) -> Result<MilvusObj, BackendError> {
        self.api
            .get(&self.name, &self.namespace)
            .await?
            .ok_or_else(|| BackendError::ResourceNotFound {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            })
    }

    async fn patch(&self, patch: &Value) -> Result<MilvusObj, BackendError> {
        debug!(name = %self.name, %patch, "patching resource");
        self.api.patch_spec(&self.name, &self.namespace, patch).await
    }

    async fn wait_healthy(
        &self,
        operation: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        wait_until_healthy(
            self.api.as_ref(),
            &self.name,
            &self.namespace,
            operation,
            timeout,
            self.wait.interval,
            cancel,
        )
        .await
    }

    /// Creates the resource after checking the operator is present, then
    /// waits for the operator to report it healthy
    pub(crate) async fn create_resource(
        &self,
        spec: MilvusSpec,
        labels: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if !self.api.crd_installed(&self.namespace).await? {
            return Err(operator_missing());
        }
        if self.api.get(&self.name, &self.namespace).await?.is_some() {
            return Err(BackendError::ResourceExists {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            });
        }

        let input = InputK8Obj::new(
            spec,
            InputObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels: labels.into_iter().collect(),
                ..Default::default()
            },
        );
        self.api.create(input).await?;
        info!(name = %self.name, namespace = %self.namespace, "Milvus resource created");

        self.wait_healthy("deploy", self.wait.create, cancel).await
    }

    fn observe(&self, obj: &MilvusObj) -> ObservedStatus {
        let spec = &obj.spec;
        let status = &obj.status;

        let mut components: BTreeMap<String, ReplicaStatus> = BTreeMap::new();
        for (name, deploy) in &status.components_deploy_status {
            let key = name
                .parse::<Component>()
                .map(|component| component.name().to_owned())
                .unwrap_or_else(|_| name.clone());
            components.insert(
                key,
                ReplicaStatus {
                    desired: deploy.desired(),
                    ready: deploy.ready(),
                },
            );
        }
        for (component, configured) in spec.components.configured() {
            let entry = components.entry(component.name().to_owned()).or_default();
            if let Some(replicas) = configured.replicas {
                entry.desired = replicas;
            } else if entry.desired == 0 {
                entry.desired = DEFAULT_REPLICAS;
            }
        }

        let managed = managed_components(spec);
        let stopped = !managed.is_empty()
            && managed.iter().all(|component| {
                spec.components
                    .get(*component)
                    .and_then(|configured| configured.replicas)
                    == Some(0)
            });

        let resources = spec
            .components
            .configured()
            .filter_map(|(component, configured)| {
                configured.resources.as_ref().map(|resources| ResourceCheck {
                    name: component.name().to_owned(),
                    usage: quantities(&resources.requests),
                    limit: quantities(&resources.limits),
                    message: "configured requests/limits".to_owned(),
                })
            })
            .collect();

        let service = |suffix: &str, port: u16| {
            format!(
                "{}-{suffix}.{}.svc.cluster.local:{port}",
                self.name, self.namespace
            )
        };

        ObservedStatus {
            status: status.status.clone(),
            endpoint: Some(status.endpoint.clone()).filter(|endpoint| !endpoint.is_empty()),
            components,
            conditions: status
                .conditions
                .iter()
                .map(|condition| ObservedCondition {
                    kind: condition.kind.clone(),
                    status: condition.status.clone(),
                    reason: condition.reason.clone(),
                    message: condition.message.clone(),
                })
                .collect(),
            dependencies: vec![
                DependencyEndpoint {
                    name: "etcd".to_owned(),
                    target: dependency_target(
                        spec.dependencies.etcd.as_ref(),
                        service("etcd", DEFAULT_ETCD_CLIENT_PORT),
                    ),
                },
                DependencyEndpoint {
                    name: "storage".to_owned(),
                    target: dependency_target(
                        spec.dependencies.storage.as_ref(),
                        service("minio", DEFAULT_MINIO_PORT),
                    ),
                },
            ],
            resources,
            stopped,
        }
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(path) = &self.connection.config_path {
            cmd.arg("--kubeconfig").arg(path);
        }
        if let Some(context) = &self.connection.context {
            cmd.arg("--context").arg(context);
        }
        cmd
    }
}

#[async_trait]
impl ClusterBackend for K8Backend {
    fn kind(&self) -> BackendType {
        BackendType::Kubernetes
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn deploy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        let spec = milvus_spec(&self.name, &self.topology, &self.version, self.with_monitor);
        self.create_resource(spec, ownership_labels(&self.name), cancel)
            .await
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn start(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        let obj = self.fetch().await?;
        let replicas = managed_components(&obj.spec)
            .into_iter()
            .map(|component| (component, self.topology.desired_replicas(component).max(1)));
        self.patch(&replicas_patch(replicas)).await?;
        self.wait_healthy("start", self.wait.scale, cancel).await
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn stop(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let obj = self.fetch().await?;
        let replicas = managed_components(&obj.spec)
            .into_iter()
            .map(|component| (component, 0));
        self.patch(&replicas_patch(replicas)).await?;
        info!("all components scaled to zero");
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.api.delete(&self.name, &self.namespace).await? {
            info!("Milvus resource deleted");
        } else {
            debug!("Milvus resource already gone");
        }
        Ok(())
    }

    async fn status(&self, _cancel: &CancellationToken) -> Result<String, BackendError> {
        let obj = self.fetch().await?;
        if obj.status.status.is_empty() {
            Ok(PENDING.to_owned())
        } else {
            Ok(obj.status.status)
        }
    }

    async fn is_running(&self, _cancel: &CancellationToken) -> bool {
        match self.fetch().await {
            Ok(obj) => obj.status.status == diagnose::HEALTHY,
            Err(err) => {
                debug!(%err, "unable to read resource status");
                false
            }
        }
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn logs(
        &self,
        cancel: &CancellationToken,
        service: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, BackendError> {
        let mut selector = format!("{INSTANCE_LABEL}={}", self.name);
        if let Some(service) = service {
            selector.push_str(&format!(",app.kubernetes.io/component={service}"));
        }
        let mut cmd = self.kubectl();
        cmd.args(["logs", "-n", &self.namespace, "-l", &selector])
            .arg(format!("--tail={tail_lines}"))
            .args(["--all-containers", "--prefix"]);
        command_output(cmd, cancel).await
    }

    #[instrument(skip(self, cancel, options), fields(cluster = %self.name))]
    async fn scale(
        &self,
        cancel: &CancellationToken,
        component: Component,
        options: &ScaleOptions,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let obj = self.fetch().await?;
        let distributed = is_cluster_mode(&obj.spec);
        let valid = if distributed {
            component != Component::Standalone
        } else {
            component == Component::Standalone
        };
        if !valid {
            let mode = if distributed { "distributed" } else { "standalone" };
            return Err(BackendError::InvalidComponent {
                component: component.to_string(),
                reason: format!("not part of a {mode} deployment"),
            });
        }

        let mut scaled = ComponentSpec::default();
        scaled.apply_scale(options);
        let mut change = Map::new();
        if options.has_replica_change() {
            change.insert("replicas".to_owned(), json!(scaled.replicas));
        }
        if let Some(resources) = ResourceRequirements::from_specs(&scaled.resources, &scaled.limits)
        {
            change.insert("resources".to_owned(), serde_json::to_value(resources)?);
        }
        let patch = json!({ "spec": { "components": { component.spec_key(): change } } });
        self.patch(&patch).await?;

        self.wait_healthy("scale", self.wait.scale, cancel).await
    }

    async fn replicas(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i32>, BackendError> {
        let obj = self.fetch().await?;
        Ok(obj
            .spec
            .components
            .configured()
            .map(|(component, configured)| {
                let replicas = configured.replicas.unwrap_or_else(|| {
                    obj.status
                        .components_deploy_status
                        .iter()
                        .find(|(name, _)| name.parse::<Component>().ok() == Some(component))
                        .map(|(_, deploy)| deploy.desired())
                        .unwrap_or(DEFAULT_REPLICAS)
                });
                (component.name().to_owned(), replicas)
            })
            .collect())
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.name))]
    async fn upgrade(&self, cancel: &CancellationToken, version: &str) -> Result<(), BackendError> {
        let version = normalize_version(version);
        let current = self.version(cancel).await?;
        if current == version {
            return Err(BackendError::SameVersion(version));
        }
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        info!(from = %current, to = %version, "upgrading");
        let patch = json!({ "spec": { "components": { "image": milvus_image(&version) } } });
        self.patch(&patch).await?;
        self.wait_healthy("upgrade", self.wait.upgrade, cancel).await
    }

    async fn version(&self, _cancel: &CancellationToken) -> Result<String, BackendError> {
        let obj = self.fetch().await?;
        Ok(obj
            .spec
            .components
            .image
            .as_deref()
            .and_then(image_tag)
            .map(normalize_version)
            .unwrap_or_else(|| self.version.clone()))
    }

    async fn config(&self, _cancel: &CancellationToken) -> Result<ConfigMap, BackendError> {
        Ok(self.fetch().await?.spec.config)
    }

    #[instrument(skip(self, cancel, config), fields(cluster = %self.name))]
    async fn set_config(
        &self,
        cancel: &CancellationToken,
        config: ConfigMap,
    ) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let mut merged = self.fetch().await?.spec.config;
        deep_merge(&mut merged, config);
        self.patch(&json!({ "spec": { "config": merged } })).await?;
        self.wait_healthy("set config", self.wait.config, cancel)
            .await
    }

    async fn diagnose(&self, cancel: &CancellationToken) -> Result<DiagnoseResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        match self.fetch().await {
            Ok(obj) => Ok(diagnose::classify(&self.observe(&obj))),
            Err(err) => {
                warn!(%err, "unable to read resource for diagnosis");
                Ok(DiagnoseResult::unreachable(err))
            }
        }
    }
}
