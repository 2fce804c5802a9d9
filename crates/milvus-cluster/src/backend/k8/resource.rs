//! The `Milvus` custom resource managed by the Milvus operator.
//!
//! Only fields this crate reads or writes are typed; everything else is kept
//! in `extra` maps so user-authored documents survive a round trip.

use std::collections::BTreeMap;

use k8_types::{Crd, CrdNames, DefaultHeader, K8Obj, Spec, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::{Component, ComponentSpec, ResourceSpec};
use crate::config_map::ConfigMap;

pub const MILVUS_GROUP: &str = "milvus.io";
pub const MILVUS_API_VERSION: &str = "v1beta1";
pub const MILVUS_KIND: &str = "Milvus";
pub const MILVUS_CRD_NAME: &str = "milvuses.milvus.io";

const MILVUS_API: Crd = Crd {
    group: MILVUS_GROUP,
    version: MILVUS_API_VERSION,
    names: CrdNames {
        kind: MILVUS_KIND,
        plural: "milvuses",
        singular: "milvus",
    },
};

pub type MilvusObj = K8Obj<MilvusSpec>;
pub type Extra = BTreeMap<String, Value>;

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusSpec {
    /// `standalone` or `cluster`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub dependencies: MilvusDependencies,
    #[serde(default)]
    pub components: MilvusComponents,
    #[serde(default, skip_serializing_if = "ConfigMap::is_empty")]
    pub config: ConfigMap,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Spec for MilvusSpec {
    type Status = MilvusStatus;
    type Header = DefaultHeader;

    fn metadata() -> &'static Crd {
        &MILVUS_API
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusDependencies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulsar: Option<Dependency>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A dependency either run by the operator (`inCluster`) or reached externally
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_cluster: Option<InClusterDependency>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InClusterDependency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_deletion: Option<bool>,
    /// helm chart values for the bundled dependency
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub values: Value,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_metric: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mix_coord: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_coord: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_coord: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_coord: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_coord: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_node: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_node: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_node: Option<MilvusComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_node: Option<MilvusComponent>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl MilvusComponents {
    pub fn get(&self, component: Component) -> Option<&MilvusComponent> {
        match component {
            Component::Standalone => self.standalone.as_ref(),
            Component::Proxy => self.proxy.as_ref(),
            Component::MixCoord => self.mix_coord.as_ref(),
            Component::RootCoord => self.root_coord.as_ref(),
            Component::QueryCoord => self.query_coord.as_ref(),
            Component::DataCoord => self.data_coord.as_ref(),
            Component::IndexCoord => self.index_coord.as_ref(),
            Component::QueryNode => self.query_node.as_ref(),
            Component::DataNode => self.data_node.as_ref(),
            Component::IndexNode => self.index_node.as_ref(),
            Component::StreamingNode => self.streaming_node.as_ref(),
        }
    }

    pub fn slot(&mut self, component: Component) -> &mut Option<MilvusComponent> {
        match component {
            Component::Standalone => &mut self.standalone,
            Component::Proxy => &mut self.proxy,
            Component::MixCoord => &mut self.mix_coord,
            Component::RootCoord => &mut self.root_coord,
            Component::QueryCoord => &mut self.query_coord,
            Component::DataCoord => &mut self.data_coord,
            Component::IndexCoord => &mut self.index_coord,
            Component::QueryNode => &mut self.query_node,
            Component::DataNode => &mut self.data_node,
            Component::IndexNode => &mut self.index_node,
            Component::StreamingNode => &mut self.streaming_node,
        }
    }

    /// Components with an explicit entry in the spec
    pub fn configured(&self) -> impl Iterator<Item = (Component, &MilvusComponent)> {
        Component::ALL
            .into_iter()
            .filter_map(|component| self.get(component).map(|spec| (component, spec)))
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusComponent {
    /// `None` lets the operator default apply; `Some(0)` scales the component down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl MilvusComponent {
    pub fn from_spec(spec: &ComponentSpec) -> Self {
        Self {
            replicas: spec.replicas,
            resources: ResourceRequirements::from_specs(&spec.resources, &spec.limits),
            extra: Extra::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

fn quantities(spec: &ResourceSpec) -> BTreeMap<String, String> {
    [
        ("cpu", &spec.cpu),
        ("memory", &spec.memory),
        ("ephemeral-storage", &spec.storage),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.clone().map(|value| (name.to_owned(), value)))
    .collect()
}

impl ResourceRequirements {
    pub fn from_specs(requests: &ResourceSpec, limits: &ResourceSpec) -> Option<Self> {
        let resources = Self {
            requests: quantities(requests),
            limits: quantities(limits),
        };
        (!resources.requests.is_empty() || !resources.limits.is_empty()).then_some(resources)
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub conditions: Vec<MilvusCondition>,
    #[serde(default)]
    pub components_deploy_status: BTreeMap<String, ComponentDeployStatus>,
}

impl Status for MilvusStatus {}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilvusCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Replica counts of one component's deployment.
///
/// Older operators report the counts directly, newer ones nest the
/// deployment status.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDeployStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
}

impl ComponentDeployStatus {
    pub fn desired(&self) -> i32 {
        self.status
            .as_ref()
            .map(|status| status.replicas)
            .or(self.replicas)
            .unwrap_or_default()
    }

    pub fn ready(&self) -> i32 {
        self.status
            .as_ref()
            .map(|status| status.ready_replicas)
            .or(self.ready_replicas)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names() {
        let crd = MilvusSpec::metadata();
        assert_eq!(crd.group, "milvus.io");
        assert_eq!(crd.names.kind, "Milvus");
        assert_eq!(crd.names.plural, "milvuses");
    }

    #[test]
    fn test_unspecified_and_zero_replicas_differ() {
        let mut components = MilvusComponents::default();
        *components.slot(Component::QueryNode) = Some(MilvusComponent {
            replicas: Some(0),
            ..Default::default()
        });
        *components.slot(Component::Proxy) = Some(MilvusComponent::default());

        let value = serde_json::to_value(&components).expect("json");
        assert_eq!(value["queryNode"]["replicas"], 0);
        assert!(value["proxy"].get("replicas").is_none());

        let back: MilvusComponents = serde_json::from_value(value).expect("parse");
        assert_eq!(back.query_node.and_then(|c| c.replicas), Some(0));
        assert_eq!(back.proxy.and_then(|c| c.replicas), None);
    }

    #[test]
    fn test_unknown_fields_survive() {
        let raw = serde_json::json!({
            "mode": "cluster",
            "dependencies": {"etcd": {"inCluster": {"deletionPolicy": "Retain", "values": {"replicaCount": 3}}}},
            "components": {"image": "milvusdb/milvus:v2.5.4", "queryNode": {"replicas": 2, "nodeSelector": {"disk": "ssd"}}},
            "hookConfig": {"a": 1}
        });
        let spec: MilvusSpec = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(spec.extra["hookConfig"]["a"], 1);
        assert_eq!(
            spec.components.get(Component::QueryNode).expect("query").extra["nodeSelector"]["disk"],
            "ssd"
        );
        assert_eq!(serde_json::to_value(&spec).expect("json"), raw);
    }

    #[test]
    fn test_deploy_status_shapes() {
        let status: MilvusStatus = serde_json::from_value(serde_json::json!({
            "status": "Healthy",
            "endpoint": "10.0.0.1:19530",
            "componentsDeployStatus": {
                "proxy": {"replicas": 2, "readyReplicas": 1},
                "querynode": {"image": "milvusdb/milvus:v2.5.4", "status": {"replicas": 3, "readyReplicas": 3}}
            }
        }))
        .expect("parse");

        let proxy = &status.components_deploy_status["proxy"];
        assert_eq!((proxy.desired(), proxy.ready()), (2, 1));
        let query = &status.components_deploy_status["querynode"];
        assert_eq!((query.desired(), query.ready()), (3, 3));
    }

    #[test]
    fn test_resources_from_spec() {
        let spec = ComponentSpec {
            replicas: Some(2),
            resources: ResourceSpec {
                cpu: Some("500m".to_owned()),
                ..Default::default()
            },
            limits: ResourceSpec {
                memory: Some("4Gi".to_owned()),
                ..Default::default()
            },
        };
        let component = MilvusComponent::from_spec(&spec);
        let resources = component.resources.expect("resources");
        assert_eq!(resources.requests["cpu"], "500m");
        assert_eq!(resources.limits["memory"], "4Gi");

        assert!(MilvusComponent::from_spec(&ComponentSpec::default()).resources.is_none());
    }
}
