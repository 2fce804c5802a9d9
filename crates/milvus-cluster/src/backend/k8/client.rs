use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error as AnyError;
use async_trait::async_trait;
use k8_client::K8Client;
use k8_client::http::status::StatusCode;
use k8_client::meta_client::{MetadataClient, PatchMergeType};
use k8_config::{ConfigError, K8Config, KubeConfig, KubeContext};
use k8_types::{InputK8Obj, InputObjectMeta, MetaStatus};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::BackendError;
use crate::meta::KubernetesConnection;

use super::resource::{MilvusObj, MilvusSpec};

const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// The slice of the Kubernetes API the backend needs for `Milvus` resources
#[async_trait]
pub trait MilvusApi: Debug + Send + Sync {
    /// Whether the `milvuses.milvus.io` definition is served by the API server
    async fn crd_installed(&self, namespace: &str) -> Result<bool, BackendError>;

    /// Fetches the resource, `None` when it does not exist
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<MilvusObj>, BackendError>;

    async fn create(&self, input: InputK8Obj<MilvusSpec>) -> Result<MilvusObj, BackendError>;

    /// Applies a JSON merge patch to the resource
    async fn patch_spec(
        &self,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<MilvusObj, BackendError>;

    /// Deletes the resource, `false` when it was already gone
    async fn delete(&self, name: &str, namespace: &str) -> Result<bool, BackendError>;
}

/// Whether the API server answered 404
fn is_not_found(err: &AnyError) -> bool {
    err.downcast_ref::<MetaStatus>()
        .and_then(|status| status.code)
        .is_some_and(|code| code == StatusCode::NOT_FOUND.as_u16())
}

#[async_trait]
impl MilvusApi for K8Client {
    async fn crd_installed(&self, namespace: &str) -> Result<bool, BackendError> {
        match self.retrieve_items::<MilvusSpec, _>(namespace).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(BackendError::K8Client(err)),
        }
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<MilvusObj>, BackendError> {
        let meta = InputObjectMeta::named(name, namespace);
        self.retrieve_item::<MilvusSpec, _>(&meta)
            .await
            .map_err(BackendError::K8Client)
    }

    async fn create(&self, input: InputK8Obj<MilvusSpec>) -> Result<MilvusObj, BackendError> {
        self.create_item(input).await.map_err(BackendError::K8Client)
    }

    async fn patch_spec(
        &self,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<MilvusObj, BackendError> {
        let meta = InputObjectMeta::named(name, namespace);
        match self
            .patch::<MilvusSpec, _>(&meta, patch, PatchMergeType::JsonMerge)
            .await
        {
            Ok(obj) => Ok(obj),
            Err(err) if is_not_found(&err) => Err(BackendError::ResourceNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
            Err(err) => Err(BackendError::K8Client(err)),
        }
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<bool, BackendError> {
        let meta = InputObjectMeta::named(name, namespace);
        match self.delete_item::<MilvusSpec, _>(&meta).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(BackendError::K8Client(err)),
        }
    }
}

/// Resolves which kubeconfig file to read: the recorded path first,
/// then the first entry of `KUBECONFIG`
pub fn kubeconfig_path(connection: &KubernetesConnection) -> Option<PathBuf> {
    if let Some(path) = &connection.config_path {
        return Some(path.clone());
    }
    let var_value = env::var(KUBECONFIG_ENV).unwrap_or_default();
    env::split_paths(&var_value)
        .find(|path| !path.as_os_str().is_empty())
}

/// Loads a Kubernetes config honoring an explicit file and context
#[instrument]
pub fn load_config(connection: &KubernetesConnection) -> Result<K8Config, ConfigError> {
    let Some(path) = kubeconfig_path(connection) else {
        if connection.context.is_none() {
            return K8Config::load();
        }
        let config = KubeConfig::from_home()?;
        return kube_context(config, connection.context.as_deref());
    };

    debug!(?path, "loading kubeconfig");
    let config = KubeConfig::from_file(&path)?;
    kube_context(config, connection.context.as_deref())
}

fn kube_context(mut config: KubeConfig, context: Option<&str>) -> Result<K8Config, ConfigError> {
    if let Some(context) = context {
        config.current_context = context.to_owned();
    }

    let current = config.current_context().ok_or(ConfigError::NoCurrentContext)?;
    let namespace = current.context.namespace().to_owned();
    let api_path = config
        .current_cluster()
        .ok_or(ConfigError::NoCurrentContext)?
        .cluster
        .server
        .clone();

    Ok(K8Config::KubeConfig(KubeContext {
        namespace,
        api_path,
        config,
    }))
}

/// Connects to the API server described by the cluster's connection record
pub fn load_client(connection: &KubernetesConnection) -> Result<Arc<dyn MilvusApi>, BackendError> {
    let config = load_config(connection)?;
    let client = K8Client::new(config).map_err(|err| BackendError::Unavailable {
        what: "Kubernetes API".to_owned(),
        hint: err.to_string(),
    })?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn api_status(code: u16) -> AnyError {
        let status: MetaStatus = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Failure",
            "message": "milvuses.milvus.io \"search\" not found",
            "reason": "NotFound",
            "code": code,
        }))
        .expect("status");
        status.into()
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(&api_status(404)));
        assert!(!is_not_found(&api_status(403)));
        assert!(!is_not_found(&anyhow::anyhow!("connection refused")));

        let wrapped = api_status(404).context("retrieving milvus");
        assert!(is_not_found(&wrapped));
    }

    #[test]
    fn test_recorded_path_wins() {
        let connection = KubernetesConnection {
            config_path: Some(PathBuf::from("/etc/kube/prod.yaml")),
            context: None,
            namespace: "milvus".to_owned(),
        };
        assert_eq!(
            kubeconfig_path(&connection),
            Some(PathBuf::from("/etc/kube/prod.yaml"))
        );
    }
}
