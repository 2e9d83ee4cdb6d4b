use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Supervisor;

/// Drives services through the s6 toolchain (`s6-svok`, `s6-svc`,
/// `s6-svwait`).
#[derive(Debug, Clone)]
pub struct S6Supervisor {
    bin_dir: Option<PathBuf>,
}

impl Default for S6Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl S6Supervisor {
    pub fn new() -> Self {
        Self { bin_dir: None }
    }

    /// Use s6 binaries from `bin_dir` instead of `$PATH`.
    pub fn with_bin_dir<P: Into<PathBuf>>(bin_dir: P) -> Self {
        Self {
            bin_dir: Some(bin_dir.into()),
        }
    }

    fn command(&self, name: &str) -> Command {
        match &self.bin_dir {
            Some(dir) => Command::new(dir.join(name)),
            None => Command::new(name),
        }
    }

    async fn status(&self, cmd: &mut Command, what: &str) -> Result<ExitStatus> {
        debug!("running {cmd:?}");
        cmd.status()
            .await
            .with_context(|| format!("Failed to run {what}"))
    }
}

#[async_trait]
impl Supervisor for S6Supervisor {
    async fn is_supervised(&self, svc_dir: &Path) -> Result<bool> {
        let status = self
            .status(self.command("s6-svok").arg(svc_dir), "s6-svok")
            .await?;
        Ok(status.success())
    }

    async fn is_down(&self, svc_dir: &Path) -> Result<bool> {
        // Wait at most 100ms for the down state; timing out means it is up.
        let status = self
            .status(
                self.command("s6-svwait")
                    .args(["-t", "100", "-d"])
                    .arg(svc_dir),
                "s6-svwait -d",
            )
            .await?;
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!("s6-svwait -d {} failed: {status}", svc_dir.display()),
        }
    }

    async fn start(&self, svc_dir: &Path) -> Result<()> {
        // Without a down marker s6 restarts the service on its own.
        if !svc_dir.join("down").exists() {
            debug!("{} is auto-started by s6", svc_dir.display());
            return Ok(());
        }
        let status = self
            .status(self.command("s6-svc").arg("-o").arg(svc_dir), "s6-svc -o")
            .await?;
        if !status.success() {
            bail!("s6-svc -o {} failed: {status}", svc_dir.display());
        }
        Ok(())
    }

    async fn wait_up(&self, svc_dir: &Path) -> Result<()> {
        let status = self
            .status(
                self.command("s6-svwait").arg("-u").arg(svc_dir),
                "s6-svwait -u",
            )
            .await?;
        if !status.success() {
            bail!("s6-svwait -u {} failed: {status}", svc_dir.display());
        }
        Ok(())
    }

    async fn wait_any_down(&self, svc_dirs: &[PathBuf]) -> Result<()> {
        info!("waiting for service exit: {svc_dirs:?}");
        let status = self
            .status(
                self.command("s6-svwait").args(["-o", "-d"]).args(svc_dirs),
                "s6-svwait -o -d",
            )
            .await?;
        // s6-svwait reports 111 here even when a service did go down.
        if !status.success() {
            warn!("s6-svwait -o -d exited with {status}");
        }
        Ok(())
    }
}
