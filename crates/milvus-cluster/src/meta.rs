//! Persisted per-cluster records.
//!
//! Every cluster owns a directory `<base>/clusters/<name>/` holding
//! `meta.json`, the defaulted `topology.yaml` and whatever the backend renders
//! (compose file, user config, data volumes).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::topology::{DeployMode, Topology, TopologyError, ValidationError};

const CLUSTERS_DIR: &str = "clusters";
const META_FILE: &str = "meta.json";
const TOPOLOGY_FILE: &str = "topology.yaml";
const LOCK_FILE: &str = ".lock";

#[derive(thiserror::Error, Debug)]
pub enum MetaError {
    #[error("cluster '{0}' not found")]
    NotFound(String),
    #[error("cluster '{name}' is locked ({path:?})")]
    Locked { name: String, path: PathBuf },
    #[error("cluster metadata io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt cluster metadata at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl MetaError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Deploying,
    Running,
    Stopped,
    Scaling,
    Upgrading,
    Unknown,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "Deploying",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Scaling => "Scaling",
            Self::Upgrading => "Upgrading",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Local,
    Kubernetes,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "docker" | "compose" => Ok(Self::Local),
            "kubernetes" | "k8s" | "k8" => Ok(Self::Kubernetes),
            other => Err(ValidationError::new(
                "backend",
                format!("must be 'local' or 'kubernetes', got '{other}'"),
            )),
        }
    }
}

/// How to reach the Kubernetes cluster a Milvus cluster lives in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConnection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub namespace: String,
}

/// Authoritative runtime record of one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub name: String,
    pub mode: DeployMode,
    pub backend: BackendType,
    pub status: ClusterStatus,
    pub version: String,
    pub port: u16,
    pub metrics_port: u16,
    #[serde(default)]
    pub with_monitor: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConnection>,
    /// user-authored Milvus resource document, for literal deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resource: Option<PathBuf>,
}

impl ClusterMeta {
    pub fn new(name: impl Into<String>, backend: BackendType, version: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            mode: DeployMode::Standalone,
            backend,
            status: ClusterStatus::Deploying,
            version: normalize_version(version),
            port: crate::topology::DEFAULT_MILVUS_PORT,
            metrics_port: crate::topology::DEFAULT_METRICS_PORT,
            with_monitor: false,
            created_at: now,
            updated_at: now,
            kubernetes: None,
            custom_resource: None,
        }
    }

    pub fn namespace(&self) -> &str {
        self.kubernetes
            .as_ref()
            .map(|conn| conn.namespace.as_str())
            .unwrap_or(crate::DEFAULT_NAMESPACE)
    }
}

/// Version strings always carry a leading `v`: `2.5.5` becomes `v2.5.5`
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    match version.strip_prefix(['v', 'V']) {
        Some(rest) => format!("v{rest}"),
        None => format!("v{version}"),
    }
}

/// File-backed store of cluster records under a base directory
#[derive(Debug, Clone)]
pub struct MetaStore {
    base_dir: PathBuf,
}

impl MetaStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cluster_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(CLUSTERS_DIR).join(name)
    }

    pub fn topology_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(TOPOLOGY_FILE)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(META_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.meta_path(name).is_file()
    }

    pub fn create_dir(&self, name: &str) -> Result<PathBuf, MetaError> {
        let dir = self.cluster_dir(name);
        fs::create_dir_all(&dir).map_err(|err| MetaError::io(&dir, err))?;
        Ok(dir)
    }

    pub fn load(&self, name: &str) -> Result<ClusterMeta, MetaError> {
        let path = self.meta_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(MetaError::NotFound(name.to_owned()));
            }
            Err(err) => return Err(MetaError::io(&path, err)),
        };
        serde_json::from_str(&contents).map_err(|source| MetaError::Corrupt { path, source })
    }

    /// Writes the record through a temporary file so readers never see half of it
    pub fn save(&self, meta: &ClusterMeta) -> Result<(), MetaError> {
        let path = self.meta_path(&meta.name);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(meta).map_err(|source| MetaError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, contents).map_err(|err| MetaError::io(&tmp, err))?;
        fs::rename(&tmp, &path).map_err(|err| MetaError::io(&path, err))?;
        debug!(cluster = %meta.name, status = %meta.status, "saved cluster metadata");
        Ok(())
    }

    /// Stamps `updated_at` and saves
    pub fn update(&self, meta: &mut ClusterMeta) -> Result<(), MetaError> {
        meta.updated_at = Utc::now();
        self.save(meta)
    }

    pub fn load_topology(&self, name: &str) -> Result<Topology, MetaError> {
        Ok(Topology::load(self.topology_path(name))?)
    }

    pub fn save_topology(&self, name: &str, topology: &Topology) -> Result<(), MetaError> {
        Ok(topology.save(self.topology_path(name))?)
    }

    pub fn remove(&self, name: &str) -> Result<(), MetaError> {
        let dir = self.cluster_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MetaError::io(&dir, err)),
        }
    }

    /// Names of all recorded clusters, sorted
    pub fn list(&self) -> Result<Vec<String>, MetaError> {
        let dir = self.base_dir.join(CLUSTERS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(MetaError::io(&dir, err)),
        };

        let mut names = vec![];
        for entry in entries {
            let entry = entry.map_err(|err| MetaError::io(&dir, err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Takes the advisory lock guarding mutations of one cluster
    pub fn lock(&self, name: &str) -> Result<ClusterLock, MetaError> {
        let path = self.cluster_dir(name).join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // dropping the guard removes the file if the owner can't be recorded
                let lock = ClusterLock { path };
                writeln!(file, "{}", std::process::id())
                    .map_err(|err| MetaError::io(&lock.path, err))?;
                debug!(cluster = name, "acquired cluster lock");
                Ok(lock)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(MetaError::Locked {
                name: name.to_owned(),
                path,
            }),
            Err(err) => Err(MetaError::io(&path, err)),
        }
    }
}

/// Held for the duration of a mutating operation; released on drop
#[derive(Debug)]
pub struct ClusterLock {
    path: PathBuf,
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "unable to release cluster lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetaStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("2.5.5"), "v2.5.5");
        assert_eq!(normalize_version("v2.5.5"), "v2.5.5");
        assert_eq!(normalize_version(" V2.4.0 "), "v2.4.0");
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = store();
        store.create_dir("dev").expect("dir");
        let mut meta = ClusterMeta::new("dev", BackendType::Kubernetes, "2.5.5");
        meta.kubernetes = Some(KubernetesConnection {
            config_path: Some(PathBuf::from("/home/me/.kube/config")),
            context: Some("staging".to_owned()),
            namespace: "vectors".to_owned(),
        });
        store.save(&meta).expect("save");

        let loaded = store.load("dev").expect("load");
        assert_eq!(loaded, meta);
        assert_eq!(loaded.version, "v2.5.5");
        assert_eq!(loaded.namespace(), "vectors");

        let raw = std::fs::read_to_string(store.cluster_dir("dev").join(META_FILE)).expect("raw");
        assert!(raw.contains("\n  \"name\": \"dev\""));
        assert!(raw.contains("\"backend\": \"kubernetes\""));
        assert!(raw.contains("\"status\": \"Deploying\""));
    }

    #[test]
    fn test_missing_cluster() {
        let (_dir, store) = store();
        assert!(!store.exists("ghost"));
        assert!(matches!(store.load("ghost"), Err(MetaError::NotFound(name)) if name == "ghost"));
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn test_list_only_recorded_clusters() {
        let (_dir, store) = store();
        for name in ["b", "a"] {
            store.create_dir(name).expect("dir");
            store
                .save(&ClusterMeta::new(name, BackendType::Local, "v2.5.4"))
                .expect("save");
        }
        store.create_dir("half-deployed").expect("dir");

        assert_eq!(store.list().expect("list"), vec!["a", "b"]);

        store.remove("a").expect("remove");
        assert_eq!(store.list().expect("list"), vec!["b"]);
        store.remove("a").expect("remove twice");
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (_dir, store) = store();
        store.create_dir("dev").expect("dir");

        let guard = store.lock("dev").expect("first lock");
        assert!(matches!(store.lock("dev"), Err(MetaError::Locked { .. })));
        drop(guard);
        assert!(store.lock("dev").is_ok());
    }

    #[test]
    fn test_lock_records_owner() {
        let (_dir, store) = store();
        store.create_dir("dev").expect("dir");
        let path = store.cluster_dir("dev").join(LOCK_FILE);

        let guard = store.lock("dev").expect("lock");
        let owner = fs::read_to_string(&path).expect("lock file");
        assert_eq!(owner.trim(), std::process::id().to_string());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_backend_type_parse() {
        assert_eq!("k8s".parse::<BackendType>().unwrap(), BackendType::Kubernetes);
        assert_eq!("Local".parse::<BackendType>().unwrap(), BackendType::Local);
        assert_eq!("nomad".parse::<BackendType>().unwrap_err().field, "backend");
    }
}
