use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CoordinationStore, StoreError, child_names};
use crate::config::XlineConfig;

/// Xline (etcd v3 API) backed store.
///
/// One `XlineStore` is one session: a lease granted at connect time and kept
/// alive in the background. Ephemeral records are written with that lease, so
/// they disappear when the agent stops refreshing it or calls [`close`].
///
/// [`close`]: XlineStore::close
pub struct XlineStore {
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    keep_alive: JoinHandle<()>,
}

impl XlineStore {
    pub async fn connect(config: &XlineConfig) -> Result<Self, StoreError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };
        let mut client = Client::connect(config.endpoints.clone(), Some(opts)).await?;

        let lease = client.lease_grant(config.session_ttl, None).await?;
        let lease_id = lease.id();
        info!(
            "xline session established, lease {lease_id:x} ttl {}s",
            lease.ttl()
        );

        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        let interval = Duration::from_secs((lease.ttl() / 3).max(1) as u64);
        let keep_alive = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = keeper.keep_alive().await {
                    error!("failed to refresh session lease {lease_id:x}: {e}");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        debug!("session lease {lease_id:x} refreshed, ttl {}s", resp.ttl());
                    }
                    Ok(_) => {
                        error!("session lease {lease_id:x} expired");
                        break;
                    }
                    Err(e) => {
                        error!("session lease {lease_id:x} keep-alive stream failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            lease_id,
            keep_alive,
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// End the session. Every ephemeral record it owns is removed by the
    /// cluster as part of the lease revocation.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.keep_alive.abort();
        let mut client = self.client.lock().await;
        match client.lease_revoke(self.lease_id).await {
            Ok(_) => {
                info!("xline session lease {:x} revoked", self.lease_id);
                Ok(())
            }
            Err(e) => {
                warn!("failed to revoke lease {:x}: {e}", self.lease_id);
                Err(e.into())
            }
        }
    }

    async fn client(&self) -> tokio::sync::MutexGuard<'_, Client> {
        self.client.lock().await
    }

    fn ensure_alive(&self) -> Result<(), StoreError> {
        if self.keep_alive.is_finished() {
            return Err(StoreError::SessionExpired(self.lease_id));
        }
        Ok(())
    }
}

impl Drop for XlineStore {
    fn drop(&mut self) {
        self.keep_alive.abort();
    }
}

#[async_trait]
impl CoordinationStore for XlineStore {
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let put_op = TxnOp::put(
            path,
            value.to_vec(),
            Some(PutOptions::new().with_lease(self.lease_id)),
        );
        let cmp = Compare::version(path, CompareOp::Equal, 0);
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let resp = self.client().await.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        Ok(())
    }

    async fn create(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        self.client()
            .await
            .put(path, value.to_vec(), Some(PutOptions::new()))
            .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self.client().await.get(path, None).await?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let resp = self
            .client()
            .await
            .get(path, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resp = self.client().await.delete(path, None).await?;
        if resp.deleted() == 0 {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(())
    }

    async fn delete_tree(&self, path: &str) -> Result<(), StoreError> {
        let path = path.trim_end_matches('/');
        let mut client = self.client().await;
        let own = client.delete(path, None).await?;
        let below = client
            .delete(
                format!("{path}/"),
                Some(DeleteOptions::new().with_prefix()),
            )
            .await?;
        debug!(
            "deleted {} records under {path}",
            own.deleted() + below.deleted()
        );
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let resp = self
            .client()
            .await
            .get(
                prefix,
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        let keys: Vec<String> = resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).to_string())
            .collect();
        Ok(child_names(path, keys.iter().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> XlineConfig {
        XlineConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            session_ttl: 10,
        }
    }

    #[tokio::test]
    #[ignore = "requires a running xline/etcd at 127.0.0.1:2379"]
    async fn test_ephemeral_records_follow_session() {
        let owner = XlineStore::connect(&local_config())
            .await
            .expect("failed to connect xline");
        let other = XlineStore::connect(&local_config())
            .await
            .expect("failed to connect xline");

        let path = "/running/rkp-test.ephemeral#0";
        let _ = owner.delete(path).await;
        owner.create_ephemeral(path, b"host-a").await.unwrap();
        assert!(matches!(
            other.create_ephemeral(path, b"host-b").await,
            Err(StoreError::NodeExists(_))
        ));
        assert_eq!(other.get_string(path).await.unwrap(), "host-a");

        owner.close().await.unwrap();
        assert!(!other.exists(path).await.unwrap());
        other.close().await.unwrap();
    }
}
