//! Coordination store access.
//!
//! Presence records live in a shared key-value store that supports
//! ephemeral keys bound to the lifetime of the client session. The agent
//! only needs a handful of path based operations, captured by
//! [`CoordinationStore`], so the registrar and reaper can run against the
//! real Xline/etcd cluster or against [`MemoryStore`] in tests.

use async_trait::async_trait;

pub mod memory;
pub mod xline;

pub use memory::MemoryStore;
pub use xline::XlineStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("no node: {0}")]
    NoNode(String),
    #[error("session lease {0} is no longer alive")]
    SessionExpired(i64),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

impl StoreError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create `path` bound to the current session. Fails with
    /// [`StoreError::NodeExists`] if any record is already stored there.
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Create a persistent record, overwriting any previous value.
    async fn create(&self, path: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Delete exactly `path`, [`StoreError::NoNode`] if it is not there.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Delete `path` and everything below it. Missing records are fine.
    async fn delete_tree(&self, path: &str) -> Result<(), StoreError>;

    /// Names of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    async fn get_string(&self, path: &str) -> Result<String, StoreError> {
        let value = self.get(path).await?;
        Ok(String::from_utf8_lossy(&value).to_string())
    }
}

/// Collect the direct child names of `parent` from a list of full keys.
pub(crate) fn child_names<'a, I>(parent: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    let mut names: Vec<String> = keys
        .into_iter()
        .filter_map(|k| k.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}
