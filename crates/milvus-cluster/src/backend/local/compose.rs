//! docker compose documents and `docker compose ps` output.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::MILVUS_IMAGE_REPO;
use crate::topology::Topology;

pub const ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.5.16";
pub const MINIO_IMAGE: &str = "minio/minio:RELEASE.2023-03-20T20-16-18Z";
pub const PROMETHEUS_IMAGE: &str = "prom/prometheus:v2.47.0";
pub const GRAFANA_IMAGE: &str = "grafana/grafana:10.1.0";

pub const ETCD_SERVICE: &str = "etcd";
pub const MINIO_SERVICE: &str = "minio";
pub const MILVUS_SERVICE: &str = "standalone";
pub const PROMETHEUS_SERVICE: &str = "prometheus";
pub const GRAFANA_SERVICE: &str = "grafana";

/// where Milvus picks up configuration overrides inside the container
pub const USER_CONFIG_MOUNT: &str = "/milvus/configs/user.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    pub name: String,
    pub services: BTreeMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    pub container_name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}

impl HealthCheck {
    fn probe(test: &[&str], start_period: Option<&str>) -> Self {
        Self {
            test: test.iter().map(|s| s.to_string()).collect(),
            interval: "30s".to_owned(),
            timeout: "20s".to_owned(),
            retries: 3,
            start_period: start_period.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeNetwork {
    pub name: String,
}

/// Inputs for rendering a standalone deployment
#[derive(Debug)]
pub struct ComposeParams<'a> {
    pub project: &'a str,
    pub version: &'a str,
    pub topology: &'a Topology,
    pub data_dir: &'a Path,
    pub deploy_dir: &'a Path,
    pub with_monitor: bool,
}

pub fn milvus_image(version: &str) -> String {
    format!("{MILVUS_IMAGE_REPO}:{version}")
}

/// Tag of an image reference: `milvusdb/milvus:v2.5.4` gives `v2.5.4`
pub fn image_tag(image: &str) -> Option<&str> {
    let (repo, tag) = image.rsplit_once(':')?;
    (!tag.contains('/') && !repo.is_empty()).then_some(tag)
}

fn volume(host: &Path, container: &str) -> String {
    format!("{}:{container}", host.display())
}

impl ComposeFile {
    pub fn render(params: &ComposeParams<'_>) -> Self {
        let project = params.project;
        let topology = params.topology;
        let etcd_port = topology
            .etcd_servers
            .first()
            .map(|etcd| etcd.client_port)
            .unwrap_or(crate::topology::DEFAULT_ETCD_CLIENT_PORT);
        let minio = topology.minio_servers.first().cloned().unwrap_or_default();
        let minio_health = format!("http://localhost:{}/minio/health/live", minio.port);
        let mut services = BTreeMap::new();

        services.insert(
            ETCD_SERVICE.to_owned(),
            ComposeService {
                container_name: format!("{project}-etcd"),
                image: ETCD_IMAGE.to_owned(),
                command: vec![
                    "etcd".to_owned(),
                    format!("-advertise-client-urls=http://{ETCD_SERVICE}:{etcd_port}"),
                    format!("-listen-client-urls=http://0.0.0.0:{etcd_port}"),
                    "--data-dir=/etcd".to_owned(),
                ],
                environment: [
                    ("ETCD_AUTO_COMPACTION_MODE", "revision"),
                    ("ETCD_AUTO_COMPACTION_RETENTION", "1000"),
                    ("ETCD_QUOTA_BACKEND_BYTES", "4294967296"),
                    ("ETCD_SNAPSHOT_COUNT", "50000"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
                volumes: vec![volume(&params.data_dir.join("etcd"), "/etcd")],
                healthcheck: Some(HealthCheck::probe(&["CMD", "etcdctl", "endpoint", "health"], None)),
                ..Default::default()
            },
        );

        services.insert(
            MINIO_SERVICE.to_owned(),
            ComposeService {
                container_name: format!("{project}-minio"),
                image: MINIO_IMAGE.to_owned(),
                command: vec![
                    "minio".to_owned(),
                    "server".to_owned(),
                    "/minio_data".to_owned(),
                    "--address".to_owned(),
                    format!(":{}", minio.port),
                    "--console-address".to_owned(),
                    format!(":{}", minio.console_port),
                ],
                environment: [
                    ("MINIO_ACCESS_KEY", minio.access_key.as_str()),
                    ("MINIO_SECRET_KEY", minio.secret_key.as_str()),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
                ports: vec![
                    format!("{0}:{0}", minio.port),
                    format!("{0}:{0}", minio.console_port),
                ],
                volumes: vec![volume(&params.data_dir.join("minio"), "/minio_data")],
                healthcheck: Some(HealthCheck::probe(
                    &["CMD", "curl", "-f", minio_health.as_str()],
                    None,
                )),
                ..Default::default()
            },
        );

        let port = topology.milvus_port();
        let metrics_port = topology.metrics_port();
        services.insert(
            MILVUS_SERVICE.to_owned(),
            ComposeService {
                container_name: format!("{project}-standalone"),
                image: milvus_image(params.version),
                command: vec!["milvus".to_owned(), "run".to_owned(), "standalone".to_owned()],
                environment: [
                    ("ETCD_ENDPOINTS".to_owned(), format!("{ETCD_SERVICE}:{etcd_port}")),
                    ("MINIO_ADDRESS".to_owned(), format!("{MINIO_SERVICE}:{}", minio.port)),
                    ("MINIO_ACCESS_KEY_ID".to_owned(), minio.access_key.clone()),
                    ("MINIO_SECRET_ACCESS_KEY".to_owned(), minio.secret_key.clone()),
                    ("MINIO_BUCKET_NAME".to_owned(), minio.bucket.clone()),
                ]
                .into_iter()
                .collect(),
                ports: vec![format!("{port}:19530"), format!("{metrics_port}:9091")],
                volumes: vec![
                    volume(&params.data_dir.join("milvus"), "/var/lib/milvus"),
                    volume(&params.deploy_dir.join("user.yaml"), USER_CONFIG_MOUNT),
                ],
                depends_on: vec![ETCD_SERVICE.to_owned(), MINIO_SERVICE.to_owned()],
                security_opt: vec!["seccomp:unconfined".to_owned()],
                healthcheck: Some(HealthCheck::probe(
                    &["CMD", "curl", "-f", "http://localhost:9091/healthz"],
                    Some("90s"),
                )),
                ..Default::default()
            },
        );

        if params.with_monitor {
            let prometheus_port = topology
                .monitoring_servers
                .first()
                .map(|server| server.port)
                .unwrap_or(crate::topology::DEFAULT_PROMETHEUS_PORT);
            let grafana_port = topology
                .grafana_servers
                .first()
                .map(|server| server.port)
                .unwrap_or(crate::topology::DEFAULT_GRAFANA_PORT);
            services.insert(
                PROMETHEUS_SERVICE.to_owned(),
                ComposeService {
                    container_name: format!("{project}-prometheus"),
                    image: PROMETHEUS_IMAGE.to_owned(),
                    ports: vec![format!("{prometheus_port}:9090")],
                    volumes: vec![volume(
                        &params.deploy_dir.join("prometheus.yml"),
                        "/etc/prometheus/prometheus.yml",
                    )],
                    depends_on: vec![MILVUS_SERVICE.to_owned()],
                    ..Default::default()
                },
            );
            services.insert(
                GRAFANA_SERVICE.to_owned(),
                ComposeService {
                    container_name: format!("{project}-grafana"),
                    image: GRAFANA_IMAGE.to_owned(),
                    ports: vec![format!("{grafana_port}:3000")],
                    depends_on: vec![PROMETHEUS_SERVICE.to_owned()],
                    ..Default::default()
                },
            );
        }

        Self {
            name: project.to_owned(),
            services,
            networks: BTreeMap::from([(
                "default".to_owned(),
                ComposeNetwork {
                    name: format!("{project}-milvus"),
                },
            )]),
        }
    }

    pub fn milvus_version(&self) -> Option<&str> {
        self.services
            .get(MILVUS_SERVICE)
            .and_then(|service| image_tag(&service.image))
    }

    pub fn set_milvus_version(&mut self, version: &str) {
        if let Some(service) = self.services.get_mut(MILVUS_SERVICE) {
            service.image = milvus_image(version);
        }
    }
}

/// Prometheus scrape config for the standalone metrics port
pub fn prometheus_config() -> String {
    format!(
        "global:\n  scrape_interval: 15s\nscrape_configs:\n  - job_name: milvus\n    metrics_path: /metrics\n    static_configs:\n      - targets: ['{MILVUS_SERVICE}:9091']\n"
    )
}

/// One container as reported by `docker compose ps --format json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    pub name: String,
    pub service: String,
    pub state: String,
    pub health: String,
    pub publishers: Option<Vec<Publisher>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Publisher {
    #[serde(rename = "URL")]
    pub url: String,
    pub target_port: u16,
    pub published_port: u16,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    /// running, and either healthy or without a health check
    pub fn is_ready(&self) -> bool {
        self.is_running() && (self.health.is_empty() || self.health.eq_ignore_ascii_case("healthy"))
    }

    pub fn published(&self, target_port: u16) -> Option<u16> {
        self.publishers
            .as_ref()?
            .iter()
            .find(|publisher| publisher.target_port == target_port && publisher.published_port != 0)
            .map(|publisher| publisher.published_port)
    }
}

/// Parses `ps` output; older compose releases print one JSON array,
/// newer ones print one object per line.
pub fn parse_ps(output: &str) -> Result<Vec<ContainerState>, serde_json::Error> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::topology::Topology;

    use super::*;

    fn render(with_monitor: bool) -> ComposeFile {
        let topology = Topology::standalone();
        ComposeFile::render(&ComposeParams {
            project: "dev",
            version: "v2.5.4",
            topology: &topology,
            data_dir: &PathBuf::from("/state/dev/data"),
            deploy_dir: &PathBuf::from("/state/dev/deploy"),
            with_monitor,
        })
    }

    #[test]
    fn test_render_standalone() {
        let compose = render(false);
        assert_eq!(
            compose.services.keys().collect::<Vec<_>>(),
            vec!["etcd", "minio", "standalone"]
        );

        let milvus = &compose.services["standalone"];
        assert_eq!(milvus.image, "milvusdb/milvus:v2.5.4");
        assert_eq!(milvus.container_name, "dev-standalone");
        assert!(milvus.ports.contains(&"19530:19530".to_owned()));
        assert_eq!(milvus.environment["ETCD_ENDPOINTS"], "etcd:2379");
        assert!(
            milvus
                .volumes
                .contains(&"/state/dev/deploy/user.yaml:/milvus/configs/user.yaml".to_owned())
        );
        assert_eq!(compose.milvus_version(), Some("v2.5.4"));

        let minio = &compose.services["minio"];
        assert_eq!(minio.environment["MINIO_ACCESS_KEY"], "minioadmin");
    }

    #[test]
    fn test_render_minio_custom_port() {
        let mut topology = Topology::standalone();
        topology.minio_servers[0].port = 9100;
        let compose = ComposeFile::render(&ComposeParams {
            project: "dev",
            version: "v2.5.4",
            topology: &topology,
            data_dir: &PathBuf::from("/state/dev/data"),
            deploy_dir: &PathBuf::from("/state/dev/deploy"),
            with_monitor: false,
        });

        let minio = &compose.services["minio"];
        let listen = minio
            .command
            .iter()
            .position(|arg| arg == "--address")
            .map(|index| minio.command[index + 1].as_str());
        assert_eq!(listen, Some(":9100"));
        assert!(minio.ports.contains(&"9100:9100".to_owned()));
        let health = minio.healthcheck.as_ref().expect("healthcheck");
        assert!(health.test.contains(&"http://localhost:9100/minio/health/live".to_owned()));
        assert_eq!(compose.services["standalone"].environment["MINIO_ADDRESS"], "minio:9100");
    }

    #[test]
    fn test_render_with_monitor() {
        let compose = render(true);
        assert!(compose.services.contains_key("prometheus"));
        assert_eq!(compose.services["grafana"].ports, vec!["3000:3000"]);
    }

    #[test]
    fn test_upgrade_image() {
        let mut compose = render(false);
        compose.set_milvus_version("v2.5.5");
        assert_eq!(compose.milvus_version(), Some("v2.5.5"));

        let yaml = serde_yaml::to_string(&compose).expect("yaml");
        let parsed: ComposeFile = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(parsed.milvus_version(), Some("v2.5.5"));
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("milvusdb/milvus:v2.5.4"), Some("v2.5.4"));
        assert_eq!(image_tag("registry:5000/milvus"), None);
        assert_eq!(image_tag("milvus"), None);
    }

    #[test]
    fn test_parse_ps_ndjson() {
        let output = r#"{"Name":"dev-etcd","Service":"etcd","State":"running","Health":"healthy","Publishers":null}
{"Name":"dev-standalone","Service":"standalone","State":"running","Health":"starting","Publishers":[{"URL":"0.0.0.0","TargetPort":19530,"PublishedPort":19530,"Protocol":"tcp"}]}
"#;
        let states = parse_ps(output).expect("parse");
        assert_eq!(states.len(), 2);
        assert!(states[0].is_ready());
        assert!(states[1].is_running());
        assert!(!states[1].is_ready());
        assert_eq!(states[1].published(19530), Some(19530));
    }

    #[test]
    fn test_parse_ps_array() {
        let output = r#"[{"Name":"dev-minio","Service":"minio","State":"exited","Health":""}]"#;
        let states = parse_ps(output).expect("parse");
        assert_eq!(states[0].service, "minio");
        assert!(!states[0].is_running());
        assert!(parse_ps("  \n").expect("empty").is_empty());
    }
}
