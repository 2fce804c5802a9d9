use super::Topology;

/// A topology or request field that failed validation
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn require_hosts<'a>(
    list: &str,
    hosts: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    for (index, host) in hosts.enumerate() {
        if host.trim().is_empty() {
            return Err(ValidationError::new(
                format!("{list}[{index}].host"),
                "host must not be empty",
            ));
        }
    }
    Ok(())
}

impl Topology {
    /// Checks the topology without touching the filesystem.
    ///
    /// TLS rules only apply when TLS is enabled.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.etcd_servers.is_empty() {
            return Err(ValidationError::new(
                "etcd_servers",
                "at least one etcd server is required",
            ));
        }
        if self.minio_servers.is_empty() {
            return Err(ValidationError::new(
                "minio_servers",
                "at least one minio server is required",
            ));
        }

        require_hosts("milvus_servers", self.milvus_servers.iter().map(|s| s.host.as_str()))?;
        require_hosts("etcd_servers", self.etcd_servers.iter().map(|s| s.host.as_str()))?;
        require_hosts("minio_servers", self.minio_servers.iter().map(|s| s.host.as_str()))?;
        require_hosts("pulsar_servers", self.pulsar_servers.iter().map(|s| s.host.as_str()))?;
        require_hosts(
            "monitoring_servers",
            self.monitoring_servers.iter().map(|s| s.host.as_str()),
        )?;
        require_hosts(
            "grafana_servers",
            self.grafana_servers.iter().map(|s| s.host.as_str()),
        )?;

        self.validate_tls()
    }

    fn validate_tls(&self) -> Result<(), ValidationError> {
        let tls = &self.global.tls;
        if !tls.enabled {
            return Ok(());
        }

        let mode = if tls.mode.trim().is_empty() {
            super::TlsMode::OneWay
        } else {
            tls.mode.parse()?
        };

        let has_files = tls.cert_file.is_some() && tls.key_file.is_some();
        let has_secret = tls.secret_name.as_deref().is_some_and(|s| !s.is_empty());
        if !has_files && !has_secret {
            return Err(ValidationError::new(
                "global.tls",
                "either cert_file and key_file or secret_name is required when TLS is enabled",
            ));
        }
        if mode == super::TlsMode::Mutual && !has_secret && tls.ca_file.is_none() {
            return Err(ValidationError::new(
                "global.tls.ca_file",
                "mutual TLS requires a CA certificate",
            ));
        }
        Ok(())
    }
}
