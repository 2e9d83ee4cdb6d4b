//! Ephemeral presence records for a running app.
//!
//! Three kinds of record announce an app instance to the rest of the cluster:
//! the running marker, one record per endpoint, and the optional identity
//! group slot. They all follow the same contract: create with a bounded retry
//! when a stale ephemeral from an expiring session is still in the way, and
//! delete only what this host wrote.

use std::sync::Arc;
use std::time::Duration;

use common::Manifest;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info};

use crate::paths;
use crate::store::{CoordinationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("unable to register {path} after {attempts} attempts")]
    RegistrationFailed { path: String, attempts: u32 },
    #[error("endpoint {0} has no allocated host port")]
    MissingRealPort(String),
    #[error("invalid manifest for {app}: {source}")]
    InvalidManifest {
        app: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            interval: Duration::from_secs(5),
        }
    }
}

/// Value stored in an identity group slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityOwner {
    pub host: String,
    pub app: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceRecord {
    Running {
        app: String,
        host: String,
    },
    Endpoint {
        app: String,
        name: String,
        host: String,
        port: Option<u16>,
    },
    Identity {
        group: String,
        identity: i64,
        owner: IdentityOwner,
    },
}

impl PresenceRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            PresenceRecord::Running { .. } => "running",
            PresenceRecord::Endpoint { .. } => "endpoint",
            PresenceRecord::Identity { .. } => "identity",
        }
    }

    pub fn path(&self) -> String {
        match self {
            PresenceRecord::Running { app, .. } => paths::running(app),
            PresenceRecord::Endpoint { app, name, .. } => paths::endpoint(app, name),
            PresenceRecord::Identity {
                group, identity, ..
            } => paths::identity_group(group, &identity.to_string()),
        }
    }

    /// Value written on registration.
    pub fn payload(&self) -> Result<Vec<u8>, PresenceError> {
        match self {
            PresenceRecord::Running { host, .. } => Ok(host.as_bytes().to_vec()),
            PresenceRecord::Endpoint {
                name, host, port, ..
            } => {
                let port = port.ok_or_else(|| PresenceError::MissingRealPort(name.clone()))?;
                Ok(format!("{host}:{port}").into_bytes())
            }
            PresenceRecord::Identity { owner, .. } => {
                Ok(serde_yaml::to_string(owner)?.into_bytes())
            }
        }
    }

    /// Whether `stored` is what this host would have written.
    ///
    /// Endpoints read back from a scheduled manifest may not know the host
    /// port; then any `host:*` value counts as ours.
    pub fn is_owned_by(&self, stored: &[u8]) -> bool {
        let stored = String::from_utf8_lossy(stored);
        match self {
            PresenceRecord::Running { host, .. } => stored == host.as_str(),
            PresenceRecord::Endpoint {
                host,
                port: Some(port),
                ..
            } => stored == format!("{host}:{port}"),
            PresenceRecord::Endpoint {
                host, port: None, ..
            } => stored.split(':').next() == Some(host.as_str()),
            PresenceRecord::Identity { owner, .. } => {
                serde_yaml::from_str::<IdentityOwner>(&stored).is_ok_and(|o| &o == owner)
            }
        }
    }
}

async fn create_ephemeral_with_retry(
    store: &dyn CoordinationStore,
    retry: RetryPolicy,
    path: &str,
    value: &[u8],
) -> Result<(), PresenceError> {
    for attempt in 1..=retry.attempts {
        match store.create_ephemeral(path, value).await {
            Ok(()) => return Ok(()),
            Err(StoreError::NodeExists(_)) => {
                info!("Node exists, will retry ({attempt}/{}): {path}", retry.attempts);
                if attempt < retry.attempts {
                    sleep(retry.interval).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PresenceError::RegistrationFailed {
        path: path.to_string(),
        attempts: retry.attempts,
    })
}

/// Registers and removes the presence records of one app instance.
pub struct AppPresence {
    store: Arc<dyn CoordinationStore>,
    manifest: Manifest,
    hostname: String,
    appname: String,
    retry: RetryPolicy,
}

impl AppPresence {
    pub fn new(store: Arc<dyn CoordinationStore>, manifest: Manifest, hostname: String) -> Self {
        let appname = manifest.name.clone();
        Self {
            store,
            manifest,
            hostname,
            appname,
            retry: RetryPolicy::default(),
        }
    }

    /// Act on behalf of another host/app, used when reaping a dead node.
    pub fn with_appname(mut self, appname: impl Into<String>) -> Self {
        self.appname = appname.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn appname(&self) -> &str {
        &self.appname
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn running_record(&self) -> PresenceRecord {
        PresenceRecord::Running {
            app: self.appname.clone(),
            host: self.hostname.clone(),
        }
    }

    pub fn endpoint_records(&self) -> Vec<PresenceRecord> {
        self.manifest
            .endpoints
            .iter()
            .map(|ep| PresenceRecord::Endpoint {
                app: self.appname.clone(),
                name: ep.name(),
                host: self.hostname.clone(),
                port: ep.real_port,
            })
            .collect()
    }

    pub fn identity_record(&self) -> Option<PresenceRecord> {
        let group = self.manifest.identity_group.as_ref().filter(|g| !g.is_empty())?;
        Some(PresenceRecord::Identity {
            group: group.clone(),
            identity: self.manifest.identity_or_invalid(),
            owner: IdentityOwner {
                host: self.hostname.clone(),
                app: self.appname.clone(),
            },
        })
    }

    /// Register identity, running marker and endpoints, in that order.
    pub async fn register(&self) -> Result<(), PresenceError> {
        self.register_identity().await?;
        self.register_running().await?;
        self.register_endpoints().await
    }

    /// Remove every record this host owns for the app.
    pub async fn unregister(&self) -> Result<(), PresenceError> {
        self.unregister_running().await?;
        self.unregister_endpoints().await?;
        self.unregister_identity().await?;
        Ok(())
    }

    pub async fn register_running(&self) -> Result<(), PresenceError> {
        info!("registering container as running: {}", self.appname);
        self.create_record(&self.running_record()).await
    }

    pub async fn register_endpoints(&self) -> Result<(), PresenceError> {
        info!("registering endpoints: {}", self.appname);
        for record in self.endpoint_records() {
            self.create_record(&record).await?;
        }
        Ok(())
    }

    /// Apps outside any identity group have nothing to register.
    pub async fn register_identity(&self) -> Result<(), PresenceError> {
        let Some(record) = self.identity_record() else {
            return Ok(());
        };
        self.create_record(&record).await
    }

    pub async fn unregister_running(&self) -> Result<bool, PresenceError> {
        info!("un-registering container as running: {}", self.appname);
        self.remove_record(&self.running_record()).await
    }

    pub async fn unregister_endpoints(&self) -> Result<(), PresenceError> {
        info!("un-registering endpoints: {}", self.appname);
        for record in self.endpoint_records() {
            self.remove_record(&record).await?;
        }
        Ok(())
    }

    pub async fn unregister_identity(&self) -> Result<bool, PresenceError> {
        match self.identity_record() {
            Some(record) => self.remove_record(&record).await,
            None => Ok(false),
        }
    }

    async fn create_record(&self, record: &PresenceRecord) -> Result<(), PresenceError> {
        let path = record.path();
        let value = record.payload()?;
        info!("register {}: {path}", record.kind());
        create_ephemeral_with_retry(self.store.as_ref(), self.retry, &path, &value)
            .await
            .inspect_err(|e| error!("failed to register {}: {e}", record.kind()))
    }

    /// Read, compare, delete. Returns whether a record was removed.
    async fn remove_record(&self, record: &PresenceRecord) -> Result<bool, PresenceError> {
        let path = record.path();
        let stored = match self.store.get(&path).await {
            Ok(v) => v,
            Err(StoreError::NoNode(_)) => {
                info!("{} node does not exist: {path}", record.kind());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if !record.is_owned_by(&stored) {
            info!(
                "{} node {path} is owned by someone else ({}), leaving it",
                record.kind(),
                String::from_utf8_lossy(&stored)
            );
            return Ok(false);
        }
        match self.store.delete(&path).await {
            Ok(()) => Ok(true),
            Err(StoreError::NoNode(_)) => {
                info!("{} node already gone: {path}", record.kind());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::{Endpoint, ServiceSpec};

    fn manifest() -> Manifest {
        Manifest {
            name: "proid.web#0000000001".to_string(),
            task: Some("0000000001".to_string()),
            identity_group: Some("proid.web-ids".to_string()),
            identity: Some(2),
            endpoints: vec![
                Endpoint {
                    port: 8000,
                    real_port: Some(32001),
                    name: Some("http".to_string()),
                },
                Endpoint {
                    port: 22,
                    real_port: Some(32002),
                    name: None,
                },
            ],
            services: vec![ServiceSpec {
                name: "web".to_string(),
                restart_count: 3,
            }],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            interval: Duration::from_millis(1),
        }
    }

    fn presence(store: &Arc<MemoryStore>, host: &str) -> AppPresence {
        AppPresence::new(store.clone(), manifest(), host.to_string()).with_retry(fast_retry())
    }

    #[tokio::test]
    async fn test_register_writes_all_records() {
        let store = Arc::new(MemoryStore::new());
        presence(&store, "host1").register().await.unwrap();

        assert_eq!(
            store.get_string("/running/proid.web#0000000001").await.unwrap(),
            "host1"
        );
        assert_eq!(
            store
                .get_string("/endpoints/proid/web#0000000001:http")
                .await
                .unwrap(),
            "host1:32001"
        );
        assert_eq!(
            store
                .get_string("/endpoints/proid/web#0000000001:22")
                .await
                .unwrap(),
            "host1:32002"
        );
        let owner: IdentityOwner = serde_yaml::from_slice(
            &store.get("/identity-groups/proid.web-ids/2").await.unwrap(),
        )
        .unwrap();
        assert_eq!(owner.host, "host1");
        assert_eq!(owner.app, "proid.web#0000000001");
        assert_eq!(store.is_ephemeral("/running/proid.web#0000000001").await, Some(true));
    }

    #[tokio::test]
    async fn test_identity_skipped_without_group() {
        let store = Arc::new(MemoryStore::new());
        let mut m = manifest();
        m.identity_group = None;
        AppPresence::new(store.clone(), m, "host1".to_string())
            .register_identity()
            .await
            .unwrap();
        assert!(store.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_running_gives_up_after_retries() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ephemeral("/running/proid.web#0000000001", b"stale-host")
            .await
            .unwrap();
        let err = presence(&store, "host1").register_running().await.unwrap_err();
        match err {
            PresenceError::RegistrationFailed { path, attempts } => {
                assert_eq!(path, "/running/proid.web#0000000001");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_succeeds_once_stale_record_expires() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ephemeral("/running/proid.web#0000000001", b"stale-host")
            .await
            .unwrap();
        let slow = AppPresence::new(store.clone(), manifest(), "host1".to_string()).with_retry(
            RetryPolicy {
                attempts: 5,
                interval: Duration::from_millis(50),
            },
        );
        let expirer = {
            let store = store.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(60)).await;
                store.expire_session().await;
            })
        };
        slow.register_running().await.unwrap();
        expirer.await.unwrap();
        assert_eq!(
            store.get_string("/running/proid.web#0000000001").await.unwrap(),
            "host1"
        );
    }

    #[tokio::test]
    async fn test_unregister_running_checks_owner() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ephemeral("/running/proid.web#0000000001", b"host2")
            .await
            .unwrap();
        let removed = presence(&store, "host1").unregister_running().await.unwrap();
        assert!(!removed);
        assert!(store.exists("/running/proid.web#0000000001").await.unwrap());

        let removed = presence(&store, "host2").unregister_running().await.unwrap();
        assert!(removed);
        assert!(!store.exists("/running/proid.web#0000000001").await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_missing_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let p = presence(&store, "host1");
        assert!(!p.unregister_running().await.unwrap());
        p.unregister_endpoints().await.unwrap();
        assert!(!p.unregister_identity().await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_endpoints_checks_hostport() {
        let store = Arc::new(MemoryStore::new());
        presence(&store, "host1").register_endpoints().await.unwrap();
        // Re-created by another session on a different port.
        store
            .delete("/endpoints/proid/web#0000000001:http")
            .await
            .unwrap();
        store
            .create_ephemeral("/endpoints/proid/web#0000000001:http", b"host1:40000")
            .await
            .unwrap();

        presence(&store, "host1").unregister_endpoints().await.unwrap();
        assert!(store.exists("/endpoints/proid/web#0000000001:http").await.unwrap());
        assert!(!store.exists("/endpoints/proid/web#0000000001:22").await.unwrap());
    }

    #[test]
    fn test_endpoint_without_port_matches_host() {
        let record = PresenceRecord::Endpoint {
            app: "p.a#1".to_string(),
            name: "http".to_string(),
            host: "host1".to_string(),
            port: None,
        };
        assert!(record.is_owned_by(b"host1:31000"));
        assert!(!record.is_owned_by(b"host10:31000"));
        assert!(matches!(
            record.payload(),
            Err(PresenceError::MissingRealPort(name)) if name == "http"
        ));
    }

    #[tokio::test]
    async fn test_full_unregister() {
        let store = Arc::new(MemoryStore::new());
        let p = presence(&store, "host1");
        p.register().await.unwrap();
        assert_eq!(store.paths().await.len(), 4);
        p.unregister().await.unwrap();
        assert!(store.paths().await.is_empty());
    }
}
