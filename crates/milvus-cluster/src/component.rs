//! Milvus sub-components and their desired state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::topology::ValidationError;

/// A named, independently scalable unit of a Milvus deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Standalone,
    Proxy,
    MixCoord,
    RootCoord,
    QueryCoord,
    DataCoord,
    IndexCoord,
    QueryNode,
    DataNode,
    IndexNode,
    StreamingNode,
}

impl Component {
    /// Components a classic distributed deployment always runs
    pub const DISTRIBUTED: [Component; 8] = [
        Component::Proxy,
        Component::RootCoord,
        Component::QueryCoord,
        Component::DataCoord,
        Component::IndexCoord,
        Component::QueryNode,
        Component::DataNode,
        Component::IndexNode,
    ];

    /// Components that only run when explicitly configured
    pub const OPTIONAL: [Component; 2] = [Component::MixCoord, Component::StreamingNode];

    pub const ALL: [Component; 11] = [
        Component::Standalone,
        Component::Proxy,
        Component::MixCoord,
        Component::RootCoord,
        Component::QueryCoord,
        Component::DataCoord,
        Component::IndexCoord,
        Component::QueryNode,
        Component::DataNode,
        Component::IndexNode,
        Component::StreamingNode,
    ];

    /// Lowercase name used in deploy status and pod labels
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Proxy => "proxy",
            Self::MixCoord => "mixcoord",
            Self::RootCoord => "rootcoord",
            Self::QueryCoord => "querycoord",
            Self::DataCoord => "datacoord",
            Self::IndexCoord => "indexcoord",
            Self::QueryNode => "querynode",
            Self::DataNode => "datanode",
            Self::IndexNode => "indexnode",
            Self::StreamingNode => "streamingnode",
        }
    }

    /// Field name inside the custom resource `spec.components`
    pub fn spec_key(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Proxy => "proxy",
            Self::MixCoord => "mixCoord",
            Self::RootCoord => "rootCoord",
            Self::QueryCoord => "queryCoord",
            Self::DataCoord => "dataCoord",
            Self::IndexCoord => "indexCoord",
            Self::QueryNode => "queryNode",
            Self::DataNode => "dataNode",
            Self::IndexNode => "indexNode",
            Self::StreamingNode => "streamingNode",
        }
    }

    /// Worker-class components that may legitimately run with zero replicas
    pub fn is_worker(&self) -> bool {
        matches!(
            self,
            Self::QueryNode | Self::DataNode | Self::IndexNode | Self::StreamingNode
        )
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Component {
    type Err = ValidationError;

    /// Accepts `queryNode`, `querynode`, `query-node` and `query_node`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .into_iter()
            .find(|component| component.name() == normalized)
            .ok_or_else(|| ValidationError::new("component", format!("unknown component '{s}'")))
    }
}

/// Resource quantities in Kubernetes notation (`500m`, `2Gi`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.storage.is_none()
    }
}

/// Desired or observed state of one sub-component.
///
/// `replicas: None` means "not applicable" or "let the operator decide"; it is
/// not the same as `Some(0)`, which forces the component down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// requests
    #[serde(skip_serializing_if = "ResourceSpec::is_empty")]
    pub resources: ResourceSpec,
    #[serde(skip_serializing_if = "ResourceSpec::is_empty")]
    pub limits: ResourceSpec,
}

impl ComponentSpec {
    pub fn with_replicas(replicas: i32) -> Self {
        Self {
            replicas: Some(replicas),
            ..Default::default()
        }
    }

    /// Folds a successful scale request into this desired state
    pub fn apply_scale(&mut self, options: &ScaleOptions) {
        if options.has_replica_change() {
            self.replicas = options.replicas;
        }
        if let Some(cpu) = non_empty(&options.cpu_request) {
            self.resources.cpu = Some(cpu.to_owned());
        }
        if let Some(memory) = non_empty(&options.memory_request) {
            self.resources.memory = Some(memory.to_owned());
        }
        if let Some(cpu) = non_empty(&options.cpu_limit) {
            self.limits.cpu = Some(cpu.to_owned());
        }
        if let Some(memory) = non_empty(&options.memory_limit) {
            self.limits.memory = Some(memory.to_owned());
        }
    }
}

/// Horizontal and/or vertical change for exactly one sub-component
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleOptions {
    pub replicas: Option<i32>,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl ScaleOptions {
    pub fn replicas(replicas: i32) -> Self {
        Self {
            replicas: Some(replicas),
            ..Default::default()
        }
    }

    pub fn has_replica_change(&self) -> bool {
        self.replicas.is_some_and(|replicas| replicas > 0)
    }

    pub fn has_resource_change(&self) -> bool {
        [
            &self.cpu_request,
            &self.cpu_limit,
            &self.memory_request,
            &self.memory_limit,
        ]
        .into_iter()
        .any(|value| non_empty(value).is_some())
    }

    /// Rejects requests that would not change anything
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(ValidationError::new(
                    "replicas",
                    format!("must not be negative, got {replicas}"),
                ));
            }
        }
        if !self.has_replica_change() && !self.has_resource_change() {
            return Err(ValidationError::new(
                "scale options",
                "at least one of replicas, cpu request/limit or memory request/limit must be set",
            ));
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_parse() {
        assert_eq!("queryNode".parse::<Component>().unwrap(), Component::QueryNode);
        assert_eq!("query-node".parse::<Component>().unwrap(), Component::QueryNode);
        assert_eq!("MIXCOORD".parse::<Component>().unwrap(), Component::MixCoord);
        assert_eq!("standalone".parse::<Component>().unwrap(), Component::Standalone);
        let err = "coordinator".parse::<Component>().unwrap_err();
        assert_eq!(err.field, "component");
    }

    #[test]
    fn test_empty_scale_rejected() {
        let err = ScaleOptions::default().validate().unwrap_err();
        assert_eq!(err.field, "scale options");

        let zero = ScaleOptions {
            replicas: Some(0),
            cpu_request: Some("  ".to_owned()),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_replica_only_scale() {
        let options = ScaleOptions::replicas(3);
        assert!(options.validate().is_ok());
        assert!(options.has_replica_change());
        assert!(!options.has_resource_change());
    }

    #[test]
    fn test_resource_only_scale() {
        let options = ScaleOptions {
            memory_limit: Some("8Gi".to_owned()),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
        assert!(!options.has_replica_change());
        assert!(options.has_resource_change());
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let err = ScaleOptions::replicas(-1).validate().unwrap_err();
        assert_eq!(err.field, "replicas");
    }

    #[test]
    fn test_apply_scale() {
        let mut spec = ComponentSpec::with_replicas(1);
        spec.apply_scale(&ScaleOptions {
            replicas: Some(4),
            cpu_limit: Some("2".to_owned()),
            ..Default::default()
        });
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.limits.cpu.as_deref(), Some("2"));
        assert!(spec.resources.is_empty());
    }
}
