use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::presence::AppPresence;
use crate::service::{ExitInfo, ServicePresence};
use crate::supervisor::Supervisor;

/// Drives one app instance from registration to its terminal exit record.
pub struct AppAgent {
    presence: AppPresence,
    services: ServicePresence,
    supervisor: Arc<dyn Supervisor>,
    /// Supervised directory of the container itself. Going down means the
    /// container is being torn down from outside.
    control_dir: Option<PathBuf>,
}

impl AppAgent {
    pub fn new(
        presence: AppPresence,
        services: ServicePresence,
        supervisor: Arc<dyn Supervisor>,
        control_dir: Option<PathBuf>,
    ) -> Self {
        AppAgent {
            presence,
            services,
            supervisor,
            control_dir,
        }
    }

    /// Register presence, keep services running under their restart policy
    /// and write the exit record once the app stops.
    ///
    /// Presence is withdrawn before returning, also when the loop failed.
    pub async fn run(&mut self) -> Result<ExitInfo> {
        self.presence
            .register()
            .await
            .with_context(|| format!("Failed to register {}", self.presence.appname()))?;

        let result = self.supervise().await;

        if let Err(e) = self.presence.unregister().await {
            warn!("Failed to unregister {}: {e}", self.presence.appname());
        }
        result
    }

    async fn supervise(&mut self) -> Result<ExitInfo> {
        self.services.ensure_supervisors_running().await?;
        let extra: Vec<PathBuf> = self.control_dir.iter().cloned().collect();

        loop {
            if let Some(refusal) = self.services.start_all().await? {
                info!(
                    "{} stopped: {} {}",
                    self.services.appname(),
                    refusal.service,
                    refusal.reason
                );
                return self.services.exit_app(Some(&refusal.service), false);
            }

            self.services.wait_for_exit(&extra).await?;

            if self.killed().await? {
                info!("{} was killed", self.services.appname());
                return self.services.exit_app(None, true);
            }
        }
    }

    async fn killed(&self) -> Result<bool> {
        match &self.control_dir {
            Some(dir) => self.supervisor.is_down(dir).await,
            None => Ok(false),
        }
    }
}
