use std::sync::Arc;

use common::Manifest;
use tracing::info;

use crate::paths;
use crate::presence::{AppPresence, PresenceError};
use crate::store::{CoordinationStore, StoreError};

/// Removes the presence of every app placed on a node that is gone.
pub struct NodeReaper {
    store: Arc<dyn CoordinationStore>,
}

impl NodeReaper {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Kill app, endpoint and server presence of `node`.
    ///
    /// Safe to call repeatedly: once the node record is gone there is
    /// nothing left to do, and every delete along the way tolerates
    /// records that have already disappeared.
    pub async fn kill_node(&self, node: &str) -> Result<(), PresenceError> {
        info!("killing node: {node}");
        if !self.store.exists(&paths::server(node)).await? {
            info!("node does not exist: {node}");
            return Ok(());
        }

        let apps = self.store.children(&paths::placement(node)).await?;
        for app in apps {
            info!("removing app presence: {app}");
            let manifest = match self.scheduled_manifest(&app).await {
                Ok(m) => m,
                Err(PresenceError::Store(StoreError::NoNode(_))) => {
                    info!("app {app} no longer scheduled");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let presence = AppPresence::new(self.store.clone(), manifest, node.to_string())
                .with_appname(app.as_str());
            presence.unregister_running().await?;
            presence.unregister_endpoints().await?;
        }

        info!("removing node: {node}");
        self.store
            .delete_tree(&paths::server_presence(node))
            .await?;
        Ok(())
    }

    async fn scheduled_manifest(&self, app: &str) -> Result<Manifest, PresenceError> {
        let data = self.store.get(&paths::scheduled(app)).await?;
        Manifest::from_yaml_slice(&data).map_err(|source| PresenceError::InvalidManifest {
            app: app.to_string(),
            source,
        })
    }
}
