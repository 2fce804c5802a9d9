//! Translation of a topology into the `Milvus` resource spec.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::warn;

use crate::backend::local::compose::milvus_image;
use crate::component::Component;
use crate::config_map::{ConfigMap, deep_merge};
use crate::topology::{DEFAULT_REPLICAS, Topology};

use super::resource::{
    Dependency, Extra, InClusterDependency, MilvusComponent, MilvusComponents, MilvusDependencies,
    MilvusSpec,
};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY: &str = "milvus-ctl";

pub const TLS_MOUNT_PATH: &str = "/milvus/tls";
const TLS_VOLUME: &str = "milvus-tls";

/// Labels forced onto every resource this crate creates
pub fn ownership_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY.to_owned()),
        (INSTANCE_LABEL.to_owned(), name.to_owned()),
    ])
}

/// Operator mode string for the topology
pub fn operator_mode(topology: &Topology) -> &'static str {
    if topology.is_distributed() {
        "cluster"
    } else {
        "standalone"
    }
}

/// Components that carry replicas in the given mode; optional ones only
/// when the spec already has them
pub fn mode_components(distributed: bool) -> &'static [Component] {
    if distributed {
        &Component::DISTRIBUTED
    } else {
        &[Component::Standalone]
    }
}

fn in_cluster(storage_class: Option<&str>) -> InClusterDependency {
    InClusterDependency {
        deletion_policy: Some("Delete".to_owned()),
        pvc_deletion: Some(true),
        values: storage_class
            .map(|class| json!({"persistence": {"storageClass": class}}))
            .unwrap_or(Value::Null),
        extra: Extra::new(),
    }
}

fn etcd_dependency(topology: &Topology) -> Dependency {
    let external: Vec<String> = topology
        .etcd_servers
        .iter()
        .filter(|etcd| etcd.external)
        .map(|etcd| format!("{}:{}", etcd.host, etcd.client_port))
        .collect();

    if external.is_empty() {
        Dependency {
            in_cluster: Some(in_cluster(topology.global.storage_class.as_deref())),
            ..Default::default()
        }
    } else {
        Dependency {
            external: true,
            endpoints: external,
            ..Default::default()
        }
    }
}

fn storage_dependency(topology: &Topology) -> Dependency {
    match topology.minio_servers.first().filter(|minio| minio.external) {
        Some(minio) => {
            let mut extra = Extra::new();
            if !minio.bucket.is_empty() {
                extra.insert("bucketName".to_owned(), Value::String(minio.bucket.clone()));
            }
            Dependency {
                external: true,
                kind: Some("MinIO".to_owned()),
                endpoint: Some(format!("{}:{}", minio.host, minio.port)),
                secret_ref: minio.secret_name.clone(),
                extra,
                ..Default::default()
            }
        }
        None => Dependency {
            in_cluster: Some(in_cluster(topology.global.storage_class.as_deref())),
            ..Default::default()
        },
    }
}

fn pulsar_dependency(topology: &Topology) -> Option<Dependency> {
    let endpoints: Vec<String> = topology
        .pulsar_servers
        .iter()
        .map(|pulsar| format!("pulsar://{}:{}", pulsar.host, pulsar.port))
        .collect();
    (!endpoints.is_empty()).then(|| Dependency {
        external: true,
        endpoints,
        ..Default::default()
    })
}

fn components(topology: &Topology, version: &str, with_monitor: bool) -> MilvusComponents {
    let mut components = MilvusComponents {
        image: Some(milvus_image(version)),
        disable_metric: with_monitor.then_some(false),
        ..Default::default()
    };

    for &component in mode_components(topology.is_distributed()) {
        *components.slot(component) = Some(MilvusComponent {
            replicas: Some(DEFAULT_REPLICAS),
            ..Default::default()
        });
    }

    if let Some(server) = topology.primary() {
        for (name, spec) in &server.components {
            let Ok(component) = name.parse::<Component>() else {
                warn!(component = %name, "ignoring unknown component override");
                continue;
            };
            *components.slot(component) = Some(MilvusComponent::from_spec(spec));
        }
    }

    components
}

/// Mounts the TLS secret and switches Milvus to TLS
fn apply_tls(name: &str, topology: &Topology, spec: &mut MilvusSpec) {
    let tls = &topology.global.tls;
    if !tls.enabled {
        return;
    }
    let secret = match &tls.secret_name {
        Some(secret) => secret.clone(),
        None => {
            let secret = format!("{name}-tls");
            warn!(%secret, "TLS enabled without a secret name, expecting the default secret");
            secret
        }
    };

    spec.components.volumes.push(json!({
        "name": TLS_VOLUME,
        "secret": {"secretName": secret},
    }));
    spec.components.volume_mounts.push(json!({
        "name": TLS_VOLUME,
        "mountPath": TLS_MOUNT_PATH,
        "readOnly": true,
    }));

    let mode = tls.tls_mode().map(|mode| mode.milvus_value()).unwrap_or(1);
    let mut tls_config = ConfigMap::new();
    tls_config.insert("common".to_owned(), json!({"security": {"tlsMode": mode}}));
    tls_config.insert(
        "tls".to_owned(),
        json!({
            "serverPemPath": format!("{TLS_MOUNT_PATH}/tls.crt"),
            "serverKeyPath": format!("{TLS_MOUNT_PATH}/tls.key"),
            "caPemPath": format!("{TLS_MOUNT_PATH}/ca.crt"),
        }),
    );
    deep_merge(&mut spec.config, tls_config);
}

/// Builds the resource spec for a fresh deployment
pub fn milvus_spec(
    name: &str,
    topology: &Topology,
    version: &str,
    with_monitor: bool,
) -> MilvusSpec {
    let mut spec = MilvusSpec {
        mode: Some(operator_mode(topology).to_owned()),
        dependencies: MilvusDependencies {
            etcd: Some(etcd_dependency(topology)),
            storage: Some(storage_dependency(topology)),
            pulsar: pulsar_dependency(topology),
            extra: Extra::new(),
        },
        components: components(topology, version, with_monitor),
        config: topology
            .primary()
            .map(|server| server.config.clone())
            .unwrap_or_default(),
        extra: Extra::new(),
    };
    apply_tls(name, topology, &mut spec);
    spec
}
