//! Health classification.
//!
//! Backends gather an [`ObservedStatus`] (one round trip to docker or the
//! Kubernetes API) and [`classify`] turns it into a [`DiagnoseResult`] without
//! doing any I/O of its own.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::Component;

/// overall status value reported by a healthy cluster
pub const HEALTHY: &str = "Healthy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckState {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: CheckState,
    pub message: String,
    pub desired: i32,
    pub ready: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityCheck {
    pub name: String,
    pub target: String,
    pub status: CheckState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCheck {
    pub name: String,
    pub usage: String,
    pub limit: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub component: String,
    pub description: String,
    pub suggestion: String,
}

/// Point-in-time health snapshot; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnoseResult {
    pub healthy: bool,
    pub summary: String,
    pub components: Vec<ComponentCheck>,
    pub connectivity: Vec<ConnectivityCheck>,
    pub resources: Vec<ResourceCheck>,
    pub issues: Vec<Issue>,
}

impl DiagnoseResult {
    /// Result for a cluster whose status could not be fetched at all
    pub fn unreachable(reason: impl fmt::Display) -> Self {
        Self {
            healthy: false,
            summary: "Cluster status could not be retrieved".to_owned(),
            components: vec![],
            connectivity: vec![],
            resources: vec![],
            issues: vec![Issue {
                severity: Severity::Error,
                component: "cluster".to_owned(),
                description: format!("unable to read cluster status: {reason}"),
                suggestion: "Check that the cluster exists and the backend is reachable".to_owned(),
            }],
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|issue| issue.severity == severity).count()
    }
}

/// Desired and ready replicas of one running component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub desired: i32,
    pub ready: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedCondition {
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

impl ObservedCondition {
    fn is_stopped(&self) -> bool {
        self.kind.ends_with("Stopped") || self.reason.ends_with("Stopped")
    }
}

/// A dependency service reached over the cluster's internal network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEndpoint {
    pub name: String,
    pub target: String,
}

/// Everything the classifier needs, already fetched by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedStatus {
    /// overall status, `Healthy` when all is well
    pub status: String,
    /// published client endpoint, if any
    pub endpoint: Option<String>,
    pub components: BTreeMap<String, ReplicaStatus>,
    pub conditions: Vec<ObservedCondition>,
    pub dependencies: Vec<DependencyEndpoint>,
    pub resources: Vec<ResourceCheck>,
    /// the cluster was stopped on purpose
    pub stopped: bool,
}

fn is_non_essential(name: &str, stopped: bool) -> bool {
    match name.parse::<Component>() {
        Ok(Component::Standalone) => stopped,
        Ok(component) => component.is_worker(),
        Err(_) => false,
    }
}

/// Classifies observed status into a health report
pub fn classify(observed: &ObservedStatus) -> DiagnoseResult {
    let mut healthy = observed.status == HEALTHY;
    let mut components = vec![];
    let mut issues = vec![];

    for (name, replicas) in &observed.components {
        let ReplicaStatus { desired, ready } = *replicas;
        let (status, message) = if desired == 0 {
            if is_non_essential(name, observed.stopped) {
                (CheckState::Ok, "scaled to 0 (expected)".to_owned())
            } else {
                healthy = false;
                issues.push(Issue {
                    severity: Severity::Error,
                    component: name.clone(),
                    description: format!("{name} has no replicas configured"),
                    suggestion: format!("Scale {name} to at least one replica"),
                });
                (CheckState::Error, "no replicas configured".to_owned())
            }
        } else if ready >= desired {
            (CheckState::Ok, format!("{ready}/{desired} ready"))
        } else if ready > 0 {
            issues.push(Issue {
                severity: Severity::Warning,
                component: name.clone(),
                description: format!("{name} is degraded: {ready}/{desired} replicas ready"),
                suggestion: format!("Inspect the {name} pods for restarts or scheduling problems"),
            });
            (CheckState::Warning, format!("degraded: {ready}/{desired} ready"))
        } else {
            healthy = false;
            issues.push(Issue {
                severity: Severity::Error,
                component: name.clone(),
                description: format!("{name} has no ready replicas (0/{desired})"),
                suggestion: format!("Check {name} pod events and logs"),
            });
            (CheckState::Error, format!("no replicas ready (0/{desired})"))
        };
        components.push(ComponentCheck {
            name: name.clone(),
            status,
            message,
            desired,
            ready,
        });
    }

    for dependency in ["etcd", "storage"] {
        components.push(ComponentCheck {
            name: dependency.to_owned(),
            status: CheckState::Ok,
            message: "managed externally to Milvus".to_owned(),
            desired: 0,
            ready: 0,
        });
    }

    let mut connectivity = vec![];
    match observed.endpoint.as_deref().filter(|endpoint| !endpoint.is_empty()) {
        Some(endpoint) => connectivity.push(ConnectivityCheck {
            name: "milvus".to_owned(),
            target: endpoint.to_owned(),
            status: CheckState::Ok,
            message: "service endpoint published".to_owned(),
        }),
        None => {
            connectivity.push(ConnectivityCheck {
                name: "milvus".to_owned(),
                target: String::new(),
                status: CheckState::Warning,
                message: "service endpoint not published yet".to_owned(),
            });
            issues.push(Issue {
                severity: Severity::Warning,
                component: "milvus".to_owned(),
                description: "no service endpoint is published".to_owned(),
                suggestion: "Wait for the service to be provisioned or check the LoadBalancer/NodePort configuration".to_owned(),
            });
        }
    }
    for dependency in &observed.dependencies {
        connectivity.push(ConnectivityCheck {
            name: dependency.name.clone(),
            target: dependency.target.clone(),
            status: CheckState::Ok,
            message: "internal endpoint".to_owned(),
        });
    }

    for condition in &observed.conditions {
        if condition.status == "False" && !condition.is_stopped() {
            issues.push(Issue {
                severity: Severity::Warning,
                component: condition.kind.clone(),
                description: format!(
                    "condition {} is False: {} {}",
                    condition.kind, condition.reason, condition.message
                )
                .trim_end()
                .to_owned(),
                suggestion: "Describe the Milvus resource for details".to_owned(),
            });
        }
    }

    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.iter().filter(|i| i.severity == Severity::Warning).count();
    let summary = if !healthy {
        format!("Cluster is unhealthy: {errors} error(s), {warnings} warning(s)")
    } else if warnings > 0 {
        format!("Cluster is healthy with {warnings} warning(s)")
    } else {
        "Cluster is healthy".to_owned()
    };

    DiagnoseResult {
        healthy,
        summary,
        components,
        connectivity,
        resources: observed.resources.clone(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(components: &[(&str, i32, i32)]) -> ObservedStatus {
        ObservedStatus {
            status: HEALTHY.to_owned(),
            endpoint: Some("10.0.0.1:19530".to_owned()),
            components: components
                .iter()
                .map(|(name, desired, ready)| {
                    (
                        name.to_string(),
                        ReplicaStatus {
                            desired: *desired,
                            ready: *ready,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    fn check<'a>(result: &'a DiagnoseResult, name: &str) -> &'a ComponentCheck {
        result
            .components
            .iter()
            .find(|c| c.name == name)
            .expect("component")
    }

    #[test]
    fn test_all_ready() {
        let result = classify(&observed(&[("querynode", 3, 3)]));
        let query = check(&result, "querynode");
        assert_eq!(query.status, CheckState::Ok);
        assert_eq!(query.message, "3/3 ready");
        assert!(result.healthy);
        assert_eq!(result.summary, "Cluster is healthy");
    }

    #[test]
    fn test_degraded() {
        let result = classify(&observed(&[("proxy", 3, 1)]));
        assert_eq!(check(&result, "proxy").status, CheckState::Warning);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].component, "proxy");
        assert_eq!(result.issues[0].severity, Severity::Warning);
        assert!(result.healthy);
        assert_eq!(result.summary, "Cluster is healthy with 1 warning(s)");
    }

    #[test]
    fn test_worker_scaled_to_zero() {
        let result = classify(&observed(&[("indexnode", 0, 0)]));
        let index = check(&result, "indexnode");
        assert_eq!(index.status, CheckState::Ok);
        assert_eq!(index.message, "scaled to 0 (expected)");
        assert!(result.issues.is_empty());
    }

    #[test]
    fn test_core_component_down() {
        let result = classify(&observed(&[("rootcoord", 2, 0)]));
        assert_eq!(check(&result, "rootcoord").status, CheckState::Error);
        assert!(!result.healthy);
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.summary, "Cluster is unhealthy: 1 error(s), 0 warning(s)");
    }

    #[test]
    fn test_core_component_zero_desired() {
        let result = classify(&observed(&[("proxy", 0, 0)]));
        let proxy = check(&result, "proxy");
        assert_eq!(proxy.status, CheckState::Error);
        assert_eq!(proxy.message, "no replicas configured");
        assert!(!result.healthy);
    }

    #[test]
    fn test_standalone_stopped_on_purpose() {
        let mut status = observed(&[("standalone", 0, 0)]);
        status.stopped = true;
        status.status = "Stopped".to_owned();
        status.conditions.push(ObservedCondition {
            kind: "MilvusReady".to_owned(),
            status: "False".to_owned(),
            reason: "MilvusStopped".to_owned(),
            message: String::new(),
        });
        let result = classify(&status);

        assert_eq!(check(&result, "standalone").status, CheckState::Ok);
        assert!(result.issues.is_empty());
        assert!(!result.healthy);

        status.stopped = false;
        let result = classify(&status);
        assert_eq!(check(&result, "standalone").status, CheckState::Error);
    }

    #[test]
    fn test_missing_endpoint_and_failed_condition() {
        let mut status = observed(&[("standalone", 1, 1)]);
        status.endpoint = None;
        status.dependencies.push(DependencyEndpoint {
            name: "etcd".to_owned(),
            target: "dev-etcd.milvus.svc.cluster.local:2379".to_owned(),
        });
        status.conditions.push(ObservedCondition {
            kind: "StorageReady".to_owned(),
            status: "False".to_owned(),
            reason: "ConnectionRefused".to_owned(),
            message: "minio unreachable".to_owned(),
        });
        let result = classify(&status);

        assert_eq!(result.connectivity[0].status, CheckState::Warning);
        assert_eq!(result.connectivity[1].status, CheckState::Ok);
        assert_eq!(result.count(Severity::Warning), 2);
        assert!(result.healthy);
        assert_eq!(result.summary, "Cluster is healthy with 2 warning(s)");
    }

    #[test]
    fn test_dependencies_listed() {
        let result = classify(&observed(&[]));
        let names: Vec<_> = result.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["etcd", "storage"]);
    }

    #[test]
    fn test_unreachable() {
        let result = DiagnoseResult::unreachable("connection refused");
        assert!(!result.healthy);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Error);
    }
}
