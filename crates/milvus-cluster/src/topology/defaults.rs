use crate::DEFAULT_NAMESPACE;

use super::{Topology, TlsConfig};

pub const LOCALHOST: &str = "127.0.0.1";
pub const STANDALONE: &str = "standalone";

pub const DEFAULT_DEPLOY_DIR: &str = "deploy";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const DEFAULT_MILVUS_PORT: u16 = 19530;
pub const DEFAULT_METRICS_PORT: u16 = 9091;
pub const DEFAULT_ETCD_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_ETCD_PEER_PORT: u16 = 2380;
pub const DEFAULT_MINIO_PORT: u16 = 9000;
pub const DEFAULT_MINIO_CONSOLE_PORT: u16 = 9001;
pub const DEFAULT_PULSAR_PORT: u16 = 6650;
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9090;
pub const DEFAULT_GRAFANA_PORT: u16 = 3000;

/// development credentials of the bundled MinIO
pub const DEFAULT_MINIO_ACCESS_KEY: &str = "minioadmin";
pub const DEFAULT_MINIO_SECRET_KEY: &str = "minioadmin";
pub const DEFAULT_MINIO_BUCKET: &str = "milvus-bucket";

pub const DEFAULT_TLS_MODE: &str = "one-way";
pub const DEFAULT_REPLICAS: i32 = 1;

fn fill(value: &mut String, default: &str) {
    if value.trim().is_empty() {
        *value = default.to_owned();
    }
}

fn fill_port(port: &mut u16, default: u16) {
    if *port == 0 {
        *port = default;
    }
}

impl Topology {
    /// Fills every unset field with its default.
    ///
    /// Only empty or zero values are touched, so applying defaults twice is a no-op.
    pub fn apply_defaults(&mut self) {
        let global = &mut self.global;
        fill(&mut global.namespace, DEFAULT_NAMESPACE);
        fill(&mut global.deploy_dir, DEFAULT_DEPLOY_DIR);
        fill(&mut global.data_dir, DEFAULT_DATA_DIR);
        fill(&mut global.log_dir, DEFAULT_LOG_DIR);
        apply_tls_defaults(&mut global.tls);

        for server in &mut self.milvus_servers {
            fill_port(&mut server.port, DEFAULT_MILVUS_PORT);
            fill_port(&mut server.metrics_port, DEFAULT_METRICS_PORT);
            fill(&mut server.mode, STANDALONE);
            for spec in server.components.values_mut() {
                spec.replicas = Some(spec.replicas.unwrap_or(DEFAULT_REPLICAS).max(DEFAULT_REPLICAS));
            }
        }

        for etcd in &mut self.etcd_servers {
            fill_port(&mut etcd.client_port, DEFAULT_ETCD_CLIENT_PORT);
            fill_port(&mut etcd.peer_port, DEFAULT_ETCD_PEER_PORT);
        }

        for minio in &mut self.minio_servers {
            fill_port(&mut minio.port, DEFAULT_MINIO_PORT);
            fill_port(&mut minio.console_port, DEFAULT_MINIO_CONSOLE_PORT);
            fill(&mut minio.access_key, DEFAULT_MINIO_ACCESS_KEY);
            fill(&mut minio.secret_key, DEFAULT_MINIO_SECRET_KEY);
            fill(&mut minio.bucket, DEFAULT_MINIO_BUCKET);
        }

        for pulsar in &mut self.pulsar_servers {
            fill_port(&mut pulsar.port, DEFAULT_PULSAR_PORT);
        }
        for monitoring in &mut self.monitoring_servers {
            fill_port(&mut monitoring.port, DEFAULT_PROMETHEUS_PORT);
        }
        for grafana in &mut self.grafana_servers {
            fill_port(&mut grafana.port, DEFAULT_GRAFANA_PORT);
        }
    }
}

fn apply_tls_defaults(tls: &mut TlsConfig) {
    fill(&mut tls.mode, DEFAULT_TLS_MODE);
}
