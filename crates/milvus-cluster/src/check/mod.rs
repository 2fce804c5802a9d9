//! Preflight checks run before a cluster is deployed.

use std::collections::HashSet;
use std::fmt::Debug;
use std::io::Error as IoError;
use std::process::Command;

use anyhow::Result;
use async_trait::async_trait;
use fluvio_command::CommandExt;
use k8_config::{ConfigError as K8ConfigError, K8Config};
use tracing::{debug, info, warn};

use crate::backend::k8::{load_client, load_config};
use crate::meta::KubernetesConnection;

/// The outcome of a check: it was either successfully performed, or it errored
///
/// Note that a check that comes back negative (a "failed" check) is still
/// captured by the `Ok` variant of a `CheckResult`, since the check completed
/// successfully. If the process of performing the check is what fails, we get
/// an `Err`.
pub type CheckResult = Result<CheckStatus>;

/// A collection of the successes and failures of running checks
pub type CheckStatuses = Vec<CheckStatus>;

/// An error occurred during the checking process
#[derive(thiserror::Error, Debug)]
pub enum ClusterCheckError {
    /// There was a problem fetching kubernetes configuration
    #[error("Kubernetes config error")]
    K8ConfigError(#[from] K8ConfigError),

    /// Docker binary not found or not runnable
    #[error("Docker not found")]
    DockerNotFoundError(IoError),

    #[error("Preflight check failed: {0}")]
    PreCheckFlightFailure(String),
}

/// Allows checks to suggest further action
pub trait CheckSuggestion {
    /// Returns `Some(suggestion)` if there is a suggestion
    /// to give, otherwise returns `None`.
    fn suggestion(&self) -> Option<String> {
        None
    }
}

/// When a check completes without error, it either passes or fails
#[derive(Debug)]
pub enum CheckStatus {
    /// This check has passed and has the given success message
    Pass(CheckSucceeded),
    /// check that cannot be recovered
    Unrecoverable(UnrecoverableCheckStatus),
}

impl CheckStatus {
    /// Creates a passing check status with a success message
    pub(crate) fn pass(msg: impl Into<String>) -> Self {
        Self::Pass(msg.into())
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }
}

/// A successful check yields a success message
pub type CheckSucceeded = String;

/// A type of check failure which is not recoverable
#[derive(thiserror::Error, Debug)]
pub enum UnrecoverableCheckStatus {
    /// `docker` is not on the path
    #[error("docker is not installed")]
    DockerNotInstalled,

    /// `docker compose` is not available
    #[error("the docker compose plugin is not available: {0}")]
    ComposeNotAvailable(String),

    /// There is no current Kubernetes context
    #[error("There is no active Kubernetes context")]
    NoActiveKubernetesContext,

    /// Unable to connect to the active context
    #[error("Failed to connect to Kubernetes via the active context: {0}")]
    CannotConnectToKubernetes(String),

    /// The Milvus custom resource definition is missing
    #[error("The Milvus operator is not installed")]
    OperatorNotInstalled,

    /// A check this one depends on did not pass
    #[error("skipped because {0} is not available")]
    MissingRequirement(String),

    /// Default unhandled K8 client error
    #[error("Unhandled K8 client error: {0}")]
    UnhandledK8ClientError(String),

    /// Other misc
    #[error("Other failure: {0}")]
    Other(String),
}

impl CheckSuggestion for UnrecoverableCheckStatus {
    fn suggestion(&self) -> Option<String> {
        let suggestion = match self {
            Self::DockerNotInstalled => "Install Docker from https://docs.docker.com/get-docker/",
            Self::ComposeNotAvailable(_) => {
                "Install the compose plugin: https://docs.docker.com/compose/install/"
            }
            Self::NoActiveKubernetesContext => "Select a context with 'kubectl config use-context'",
            Self::OperatorNotInstalled => {
                return Some(format!(
                    "Run 'kubectl apply -f {}'",
                    crate::backend::k8::OPERATOR_MANIFEST
                ));
            }
            _ => return None,
        };
        Some(suggestion.to_owned())
    }
}

/// Things a check can provide for other checks
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum ClusterComponent {
    ContainerEngine,
    Kubernetes,
}

#[async_trait]
pub trait ClusterCheck: Debug + 'static + Send + Sync {
    /// Returns label that can be used
    fn label(&self) -> &str;

    /// can register as component that other checker can depend on
    fn component(&self) -> Option<ClusterComponent> {
        None
    }

    /// list of components that must be available before checking
    fn required_components(&self) -> Vec<ClusterComponent> {
        vec![]
    }

    /// perform check, if successful return success message, if fail, return
    async fn perform_check(&self) -> CheckResult;
}

/// Docker with the compose plugin
#[derive(Debug)]
pub(crate) struct DockerCompose;

#[async_trait]
impl ClusterCheck for DockerCompose {
    async fn perform_check(&self) -> CheckResult {
        if which::which("docker").is_err() {
            return Ok(CheckStatus::Unrecoverable(
                UnrecoverableCheckStatus::DockerNotInstalled,
            ));
        }

        let output = Command::new("docker")
            .args(["compose", "version", "--short"])
            .output()
            .map_err(ClusterCheckError::DockerNotFoundError)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Ok(CheckStatus::Unrecoverable(
                UnrecoverableCheckStatus::ComposeNotAvailable(stderr),
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(CheckStatus::pass(format!("docker compose {version} found")))
    }

    fn component(&self) -> Option<ClusterComponent> {
        Some(ClusterComponent::ContainerEngine)
    }

    fn label(&self) -> &str {
        "Docker compose"
    }
}

/// Docker daemon answers
#[derive(Debug)]
pub(crate) struct DockerDaemon;

#[async_trait]
impl ClusterCheck for DockerDaemon {
    async fn perform_check(&self) -> CheckResult {
        match Command::new("docker")
            .args(["info", "--format", "{{.ServerVersion}}"])
            .result()
        {
            Ok(output) => Ok(CheckStatus::pass(format!(
                "Docker daemon {} is running",
                String::from_utf8_lossy(&output.stdout).trim()
            ))),
            Err(err) => Ok(CheckStatus::Unrecoverable(UnrecoverableCheckStatus::Other(
                format!("Docker daemon is not reachable: {}", err.source),
            ))),
        }
    }

    fn required_components(&self) -> Vec<ClusterComponent> {
        vec![ClusterComponent::ContainerEngine]
    }

    fn label(&self) -> &str {
        "Docker daemon"
    }
}

/// Check for loading
#[derive(Debug)]
pub(crate) struct ActiveKubernetesCluster {
    connection: KubernetesConnection,
}

#[async_trait]
impl ClusterCheck for ActiveKubernetesCluster {
    /// Checks that we can connect to Kubernetes via the active context
    async fn perform_check(&self) -> CheckResult {
        let config = match load_config(&self.connection) {
            Ok(config) => config,
            Err(K8ConfigError::NoCurrentContext) => {
                return Ok(CheckStatus::Unrecoverable(
                    UnrecoverableCheckStatus::NoActiveKubernetesContext,
                ));
            }

            Err(err) => {
                return Ok(CheckStatus::Unrecoverable(
                    UnrecoverableCheckStatus::UnhandledK8ClientError(format!("K8 Error: {err:#?}")),
                ));
            }
        };

        let context = match config {
            K8Config::Pod(_) => {
                return Ok(CheckStatus::pass("Running inside a Kubernetes pod"));
            }
            K8Config::KubeConfig(context) => context,
        };

        match context.config.current_cluster() {
            Some(cluster) => Ok(CheckStatus::pass(format!(
                "Kubectl active cluster {} at: {} found",
                context.config.current_context, cluster.cluster.server
            ))),
            None => Ok(CheckStatus::Unrecoverable(
                UnrecoverableCheckStatus::NoActiveKubernetesContext,
            )),
        }
    }

    fn component(&self) -> Option<ClusterComponent> {
        Some(ClusterComponent::Kubernetes)
    }

    fn label(&self) -> &str {
        "Kubernetes config"
    }
}

/// The Milvus operator CRD is served
#[derive(Debug)]
pub(crate) struct MilvusOperator {
    connection: KubernetesConnection,
}

#[async_trait]
impl ClusterCheck for MilvusOperator {
    async fn perform_check(&self) -> CheckResult {
        let client = match load_client(&self.connection) {
            Ok(client) => client,
            Err(err) => {
                return Ok(CheckStatus::Unrecoverable(
                    UnrecoverableCheckStatus::CannotConnectToKubernetes(err.to_string()),
                ));
            }
        };

        match client.crd_installed(&self.connection.namespace).await {
            Ok(true) => Ok(CheckStatus::pass("Milvus operator CRD found")),
            Ok(false) => Ok(CheckStatus::Unrecoverable(
                UnrecoverableCheckStatus::OperatorNotInstalled,
            )),
            Err(err) => Ok(CheckStatus::Unrecoverable(
                UnrecoverableCheckStatus::CannotConnectToKubernetes(err.to_string()),
            )),
        }
    }

    fn required_components(&self) -> Vec<ClusterComponent> {
        vec![ClusterComponent::Kubernetes]
    }

    fn label(&self) -> &str {
        "Milvus operator"
    }
}

/// Manages all cluster check operations
///
/// A `ClusterChecker` can be configured with different sets of checks to run.
/// It can wait for all checks to run sequentially using [`run`].
///
/// [`run`]: ClusterChecker::run
#[derive(Debug)]
#[non_exhaustive]
pub struct ClusterChecker {
    checks: Vec<Box<dyn ClusterCheck>>,
}

impl ClusterChecker {
    /// Creates an empty checker with no checks to be run.
    ///
    /// Be sure to use methods like [`with_check`] to add checks before
    /// calling the `run` method, or it will do nothing.
    ///
    /// # Example
    ///
    /// ```
    /// # use milvus_cluster::ClusterChecker;
    /// let checker: ClusterChecker = ClusterChecker::empty();
    /// ```
    ///
    /// [`with_check`]: ClusterChecker::with_check
    pub fn empty() -> Self {
        ClusterChecker { checks: vec![] }
    }

    /// Adds a check to this `ClusterChecker`
    pub fn with_check<C: ClusterCheck>(mut self, check: impl Into<Box<C>>) -> Self {
        self.checks.push(check.into());
        self
    }

    /// Adds all checks required for a docker compose deployment.
    ///
    /// Note that no checks are run until the [`run`] method is invoked.
    ///
    /// [`run`]: ClusterChecker::run
    pub fn with_local_checks(mut self) -> Self {
        let checks: Vec<Box<dyn ClusterCheck>> = vec![Box::new(DockerCompose), Box::new(DockerDaemon)];
        self.checks.extend(checks);
        self
    }

    /// Adds all checks required for a deployment through the Milvus operator.
    ///
    /// Note that no checks are run until the [`run`] method is invoked.
    ///
    /// [`run`]: ClusterChecker::run
    pub fn with_k8_checks(mut self, connection: &KubernetesConnection) -> Self {
        let checks: Vec<Box<dyn ClusterCheck>> = vec![
            Box::new(ActiveKubernetesCluster {
                connection: connection.clone(),
            }),
            Box::new(MilvusOperator {
                connection: connection.clone(),
            }),
        ];
        self.checks.extend(checks);
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check in order, skipping checks whose requirements failed.
    ///
    /// A check that errors out is reported as an unrecoverable failure.
    pub async fn run(self) -> CheckStatuses {
        let mut components: HashSet<ClusterComponent> = HashSet::new();
        let mut statuses = vec![];

        for check in self.checks {
            let missing = check
                .required_components()
                .into_iter()
                .find(|component| !components.contains(component));

            let status = match missing {
                Some(component) => CheckStatus::Unrecoverable(
                    UnrecoverableCheckStatus::MissingRequirement(format!("{component:?}")),
                ),
                None => {
                    debug!(check = check.label(), "checking");
                    match check.perform_check().await {
                        Ok(status) => status,
                        Err(err) => CheckStatus::Unrecoverable(UnrecoverableCheckStatus::Other(
                            format!("{err:#}"),
                        )),
                    }
                }
            };

            match &status {
                CheckStatus::Pass(message) => {
                    info!(check = check.label(), %message, "check passed");
                    if let Some(component) = check.component() {
                        debug!(?component, "component registered");
                        components.insert(component);
                    }
                }
                CheckStatus::Unrecoverable(err) => {
                    warn!(check = check.label(), %err, "check failed");
                }
            }
            statuses.push(status);
        }

        statuses
    }

    /// Runs the checks and fails with every failure and suggestion joined
    pub async fn run_and_require_pass(self) -> Result<CheckStatuses, ClusterCheckError> {
        let statuses = self.run().await;
        let failures: Vec<String> = statuses
            .iter()
            .filter_map(|status| match status {
                CheckStatus::Pass(_) => None,
                CheckStatus::Unrecoverable(err) => Some(match err.suggestion() {
                    Some(suggestion) => format!("{err} ({suggestion})"),
                    None => err.to_string(),
                }),
            })
            .collect();

        if failures.is_empty() {
            Ok(statuses)
        } else {
            Err(ClusterCheckError::PreCheckFlightFailure(failures.join("; ")))
        }
    }
}
