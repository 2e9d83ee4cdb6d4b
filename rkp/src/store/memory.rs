use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CoordinationStore, StoreError, child_names};

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    ephemeral: bool,
}

/// In-process store with a single session.
///
/// Ephemeral records survive until [`MemoryStore::expire_session`] is called,
/// which mimics the owning session timing out on a real cluster.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every ephemeral record, as the cluster does when the session dies.
    pub async fn expire_session(&self) {
        self.records.lock().await.retain(|_, r| !r.ephemeral);
    }

    pub async fn is_ephemeral(&self, path: &str) -> Option<bool> {
        self.records.lock().await.get(path).map(|r| r.ephemeral)
    }

    pub async fn paths(&self) -> Vec<String> {
        self.records.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        records.insert(
            path.to_string(),
            Record {
                value: value.to_vec(),
                ephemeral: true,
            },
        );
        Ok(())
    }

    async fn create(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records.lock().await.insert(
            path.to_string(),
            Record {
                value: value.to_vec(),
                ephemeral: false,
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.records
            .lock()
            .await
            .get(path)
            .map(|r| r.value.clone())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn delete_tree(&self, path: &str) -> Result<(), StoreError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.records
            .lock()
            .await
            .retain(|k, _| k != path && !k.starts_with(&prefix));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.lock().await;
        Ok(child_names(path, records.keys().map(String::as_str)))
    }
}
