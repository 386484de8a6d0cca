//! Finding the master and waiting for the cluster to come up.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::Client;
use crate::common::Backoff;
use crate::core::{Address, GfsError, Result};

/// Where the processes of a cluster were scheduled.
#[async_trait]
pub trait Placement: Send + Sync {
    fn master_address(&self) -> Result<Address>;

    /// Names of the processes scheduled for `component`.
    async fn workers(&self, component: &str) -> Result<Vec<String>>;
}

/// Placement published through environment variables, namespaced by user:
/// `<USER>_MASTER_SERVICE_HOST`, `<USER>_MASTER_SERVICE_PORT`, and a
/// comma-separated `<USER>_<COMPONENT>S` list per component.
pub struct EnvPlacement {
    user: String,
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvPlacement {
    pub fn new(user: &str) -> EnvPlacement {
        Self::with_lookup(user, |key| std::env::var(key).ok())
    }

    fn with_lookup(user: &str, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> EnvPlacement {
        EnvPlacement { user: user.to_uppercase(), lookup: Box::new(lookup) }
    }

    fn var(&self, suffix: &str) -> Result<String> {
        let key = format!("{}_{}", self.user, suffix).to_uppercase().replace('-', "_");
        (self.lookup)(&key).ok_or_else(|| GfsError::NotFound(format!("environment variable {key}")))
    }
}

#[async_trait]
impl Placement for EnvPlacement {
    fn master_address(&self) -> Result<Address> {
        let host = self.var("MASTER_SERVICE_HOST")?;
        let port = self.var("MASTER_SERVICE_PORT")?;
        Ok(format!("{host}:{port}"))
    }

    async fn workers(&self, component: &str) -> Result<Vec<String>> {
        // Not scheduled yet.
        let Ok(list) = self.var(&format!("{component}s")) else {
            return Ok(Vec::new());
        };
        Ok(list.split(',').map(str::trim).filter(|w| !w.is_empty()).map(String::from).collect())
    }
}

/// Fixed placement, for tests and single-host clusters.
#[derive(Debug, Clone, Default)]
pub struct StaticPlacement {
    pub master: Address,
    pub workers: HashMap<String, Vec<String>>,
}

#[async_trait]
impl Placement for StaticPlacement {
    fn master_address(&self) -> Result<Address> {
        Ok(self.master.clone())
    }

    async fn workers(&self, component: &str) -> Result<Vec<String>> {
        Ok(self.workers.get(component).cloned().unwrap_or_default())
    }
}

/// Wait until `expected` processes of `component` have been scheduled.
pub async fn wait_for_workers(
    placement: &dyn Placement,
    component: &str,
    expected: usize,
    mut backoff: Backoff,
) -> Result<Vec<String>> {
    let mut seen = Vec::new();
    while backoff.attempt() {
        seen = placement.workers(component).await?;
        if seen.len() >= expected {
            info!("{} {component} processes scheduled", seen.len());
            return Ok(seen);
        }
        debug!("waiting for {component}: {}/{expected}", seen.len());
        backoff.wait().await;
    }
    Err(GfsError::Timeout(format!("only {}/{expected} {component} processes scheduled", seen.len())))
}

/// Wait until `expected` chunkservers have registered with the master.
pub async fn wait_for_servers(client: &Client, expected: usize, mut backoff: Backoff) -> Result<Vec<Address>> {
    let mut seen = Vec::new();
    while backoff.attempt() {
        match client.servers().await {
            Ok(servers) if servers.len() >= expected => {
                info!("{} chunkservers registered", servers.len());
                return Ok(servers);
            }
            Ok(servers) => seen = servers,
            Err(e) if e.is_retryable() => debug!("master not reachable yet: {e}"),
            Err(e) => return Err(e),
        }
        backoff.wait().await;
    }
    Err(GfsError::Timeout(format!("only {}/{expected} chunkservers registered", seen.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::common::NetworkShim;
    use crate::config::Config;

    fn env(vars: &[(&str, &str)]) -> EnvPlacement {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EnvPlacement::with_lookup("student", move |key| vars.get(key).cloned())
    }

    fn quick() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3)
    }

    #[tokio::test]
    async fn env_placement() {
        let placement = env(&[
            ("STUDENT_MASTER_SERVICE_HOST", "10.0.0.1"),
            ("STUDENT_MASTER_SERVICE_PORT", "7000"),
            ("STUDENT_WORKERS", "w1, w2,,w3"),
        ]);
        assert_eq!(placement.master_address().unwrap(), "10.0.0.1:7000");
        assert_eq!(placement.workers("worker").await.unwrap(), vec!["w1", "w2", "w3"]);
        assert!(placement.workers("student-worker").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_master_is_not_found() {
        let placement = env(&[("STUDENT_MASTER_SERVICE_HOST", "10.0.0.1")]);
        assert!(matches!(placement.master_address(), Err(GfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn waiting_is_bounded() {
        let placement = StaticPlacement {
            master: "master".into(),
            workers: HashMap::from([("worker".to_string(), vec!["w1".to_string()])]),
        };
        assert_eq!(wait_for_workers(&placement, "worker", 1, quick()).await.unwrap(), vec!["w1"]);
        let err = wait_for_workers(&placement, "worker", 2, quick()).await.unwrap_err();
        assert!(matches!(err, GfsError::Timeout(_)));

        // Nothing answers at the master address.
        let client = Client::new("c", "master".into(), Config::default(), Arc::new(NetworkShim::new()));
        let err = wait_for_servers(&client, 1, quick()).await.unwrap_err();
        assert!(matches!(err, GfsError::Timeout(_)));
    }
}
