use std::pin::pin;
use std::time::{Duration, Instant};

use fluvio_future::timer::sleep;
use futures_util::future::{Either, select};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BackendError;
use crate::backend::env_secs;
use crate::diagnose::HEALTHY;

use super::client::MilvusApi;

pub static CREATE_TIMEOUT: Lazy<Duration> =
    Lazy::new(|| env_secs("MILVUS_CLUSTER_CREATE_TIMEOUT", 600));
pub static SCALE_TIMEOUT: Lazy<Duration> =
    Lazy::new(|| env_secs("MILVUS_CLUSTER_SCALE_TIMEOUT", 300));
pub static UPGRADE_TIMEOUT: Lazy<Duration> =
    Lazy::new(|| env_secs("MILVUS_CLUSTER_UPGRADE_TIMEOUT", 900));
pub static CONFIG_TIMEOUT: Lazy<Duration> =
    Lazy::new(|| env_secs("MILVUS_CLUSTER_CONFIG_TIMEOUT", 600));
pub static POLL_INTERVAL: Lazy<Duration> =
    Lazy::new(|| env_secs("MILVUS_CLUSTER_POLL_INTERVAL", 5));

/// Deadlines for the readiness waits of each operation
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub create: Duration,
    pub scale: Duration,
    pub upgrade: Duration,
    pub config: Duration,
    pub interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            create: *CREATE_TIMEOUT,
            scale: *SCALE_TIMEOUT,
            upgrade: *UPGRADE_TIMEOUT,
            config: *CONFIG_TIMEOUT,
            interval: *POLL_INTERVAL,
        }
    }
}

impl WaitConfig {
    /// Short waits, used by tests
    pub fn uniform(timeout: Duration, interval: Duration) -> Self {
        Self {
            create: timeout,
            scale: timeout,
            upgrade: timeout,
            config: timeout,
            interval,
        }
    }
}

/// Polls the resource until the operator reports it healthy.
///
/// Read errors while polling are logged and retried; only the deadline or
/// the cancellation token end the wait early.
pub async fn wait_until_healthy(
    api: &dyn MilvusApi,
    name: &str,
    namespace: &str,
    operation: &'static str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), BackendError> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let read = match select(pin!(api.get(name, namespace)), pin!(cancel.cancelled())).await {
            Either::Left((read, _)) => read,
            Either::Right(_) => return Err(BackendError::Cancelled),
        };
        match read {
            Ok(Some(obj)) if obj.status.status == HEALTHY => {
                info!(name, operation, attempt, "cluster healthy");
                return Ok(());
            }
            Ok(Some(obj)) => {
                debug!(name, attempt, status = %obj.status.status, "waiting for cluster");
            }
            Ok(None) => debug!(name, attempt, "resource not visible yet"),
            Err(err) => warn!(name, attempt, %err, "failed to read cluster status, retrying"),
        }

        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let waited = started.elapsed();
        if waited >= timeout {
            return Err(BackendError::Timeout { operation, waited });
        }

        let nap = interval.min(timeout - waited);
        if let Either::Right(_) = select(pin!(sleep(nap)), pin!(cancel.cancelled())).await {
            return Err(BackendError::Cancelled);
        }
    }
}
