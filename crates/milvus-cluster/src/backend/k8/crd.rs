use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::BackendError;
use crate::backend::ClusterBackend;
use crate::backend::local::compose::milvus_image;
use crate::component::{Component, ScaleOptions};
use crate::config_map::ConfigMap;
use crate::diagnose::DiagnoseResult;
use crate::meta::BackendType;

use super::K8Backend;
use super::render::ownership_labels;
use super::resource::{MILVUS_KIND, MilvusSpec};

/// Deploys a user-authored `Milvus` document instead of rendering one.
///
/// Name, namespace and ownership labels always come from the cluster record;
/// everything else in the document is sent as written.
#[derive(Debug)]
pub struct CustomResourceBackend {
    inner: K8Backend,
    document: PathBuf,
}

/// Parsed user document
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CustomResource {
    pub spec: MilvusSpec,
    pub labels: BTreeMap<String, String>,
}

impl CustomResource {
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let document: Value = serde_yaml::from_str(raw)?;

        let kind = document.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind != MILVUS_KIND {
            return Err(BackendError::InvalidResource(format!(
                "expected kind '{MILVUS_KIND}', found '{kind}'"
            )));
        }

        let spec = match document.get("spec") {
            Some(spec) if !spec.is_null() => serde_json::from_value(spec.clone())?,
            _ => MilvusSpec::default(),
        };
        let labels = document
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(key, value)| {
                        value.as_str().map(|value| (key.clone(), value.to_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { spec, labels })
    }
}

impl CustomResourceBackend {
    pub fn new(inner: K8Backend, document: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            document: document.into(),
        }
    }

    pub fn document(&self) -> &Path {
        &self.document
    }
}

#[async_trait]
impl ClusterBackend for CustomResourceBackend {
    fn kind(&self) -> BackendType {
        BackendType::Kubernetes
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.inner.name()))]
    async fn deploy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        let CustomResource {
            mut spec,
            mut labels,
        } = CustomResource::load(&self.document)?;
        debug!(document = ?self.document, "deploying custom resource");

        labels.extend(ownership_labels(self.inner.name()));
        if spec.components.image.is_none() {
            spec.components.image = Some(milvus_image(self.inner.target_version()));
        }
        self.inner.create_resource(spec, labels, cancel).await
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.inner.start(cancel).await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.inner.stop(cancel).await
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        self.inner.destroy(cancel).await
    }

    async fn status(&self, cancel: &CancellationToken) -> Result<String, BackendError> {
        self.inner.status(cancel).await
    }

    async fn is_running(&self, cancel: &CancellationToken) -> bool {
        self.inner.is_running(cancel).await
    }

    async fn logs(
        &self,
        cancel: &CancellationToken,
        service: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, BackendError> {
        self.inner.logs(cancel, service, tail_lines).await
    }

    async fn scale(
        &self,
        _cancel: &CancellationToken,
        _component: Component,
        _options: &ScaleOptions,
    ) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented("scale"))
    }

    async fn replicas(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, i32>, BackendError> {
        self.inner.replicas(cancel).await
    }

    async fn upgrade(&self, cancel: &CancellationToken, version: &str) -> Result<(), BackendError> {
        self.inner.upgrade(cancel, version).await
    }

    async fn version(&self, cancel: &CancellationToken) -> Result<String, BackendError> {
        self.inner.version(cancel).await
    }

    async fn config(&self, cancel: &CancellationToken) -> Result<ConfigMap, BackendError> {
        self.inner.config(cancel).await
    }

    async fn set_config(
        &self,
        cancel: &CancellationToken,
        config: ConfigMap,
    ) -> Result<(), BackendError> {
        self.inner.set_config(cancel, config).await
    }

    async fn diagnose(&self, cancel: &CancellationToken) -> Result<DiagnoseResult, BackendError> {
        self.inner.diagnose(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::backend::BackendContext;
    use crate::backend::k8::WaitConfig;
    use crate::backend::k8::fixture::MemoryMilvusApi;
    use crate::backend::k8::render::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
    use crate::meta::{ClusterMeta, KubernetesConnection};
    use crate::topology::Topology;

    use super::*;

    const DOCUMENT: &str = r#"
apiVersion: milvus.io/v1beta1
kind: Milvus
metadata:
  name: ignored
  namespace: elsewhere
  labels:
    team: search
    app.kubernetes.io/managed-by: someone-else
spec:
  mode: cluster
  components:
    queryNode:
      replicas: 3
      nodeSelector:
        disk: ssd
  config:
    log:
      level: debug
"#;

    fn backend(document: &Path, api: Arc<MemoryMilvusApi>) -> CustomResourceBackend {
        let mut meta = ClusterMeta::new("vectors", BackendType::Kubernetes, "2.5.4");
        meta.kubernetes = Some(KubernetesConnection {
            namespace: "search".to_owned(),
            ..Default::default()
        });
        meta.custom_resource = Some(document.to_owned());
        let context = BackendContext {
            meta,
            topology: Topology::standalone(),
            cluster_dir: document.parent().map(Path::to_owned).unwrap_or_default(),
        };
        let inner = K8Backend::with_api(&context, api).with_wait(WaitConfig::uniform(
            Duration::from_millis(300),
            Duration::from_millis(10),
        ));
        CustomResourceBackend::new(inner, document)
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let err = CustomResource::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n")
            .expect_err("wrong kind");
        assert!(matches!(err, BackendError::InvalidResource(_)));
        assert!(err.to_string().contains("ConfigMap"));
    }

    #[fluvio_future::test]
    async fn test_deploy_overrides_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("milvus.yaml");
        fs::write(&path, DOCUMENT).expect("write");

        let api = Arc::new(MemoryMilvusApi::default());
        let backend = backend(&path, api.clone());
        backend
            .deploy(&CancellationToken::new())
            .await
            .expect("deploy");

        assert!(api.object("elsewhere", "ignored").is_none());
        let obj = api.object("search", "vectors").expect("created");
        let labels = &obj.metadata.labels;
        assert_eq!(labels.get("team").map(String::as_str), Some("search"));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY));
        assert_eq!(labels.get(INSTANCE_LABEL).map(String::as_str), Some("vectors"));

        let query = obj.spec.components.get(Component::QueryNode).expect("query");
        assert_eq!(query.replicas, Some(3));
        assert_eq!(query.extra["nodeSelector"]["disk"], "ssd");
        assert_eq!(obj.spec.config["log"]["level"], "debug");
        assert_eq!(obj.spec.components.image.as_deref(), Some("milvusdb/milvus:v2.5.4"));
    }

    #[fluvio_future::test]
    async fn test_scale_not_implemented() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("milvus.yaml");
        fs::write(&path, DOCUMENT).expect("write");

        let api = Arc::new(MemoryMilvusApi::default());
        let backend = backend(&path, api.clone());
        let cancel = CancellationToken::new();
        backend.deploy(&cancel).await.expect("deploy");

        let err = backend
            .scale(&cancel, Component::QueryNode, &ScaleOptions::replicas(5))
            .await
            .expect_err("not implemented");
        assert!(matches!(err, BackendError::NotImplemented("scale")));
        assert!(api.patches().is_empty());

        backend.stop(&cancel).await.expect("stop delegates");
        assert_eq!(api.patches().len(), 1);
    }
}
