use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub mod s6;

pub use s6::S6Supervisor;

/// Process supervision primitives for service directories.
///
/// The supervisor owns the processes; the agent only asks it to bring a
/// service up and waits for state changes. Each exit is appended by the
/// supervisor's finish hook to `<svc_dir>/finished`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Whether a supervisor process is attached to `svc_dir`.
    async fn is_supervised(&self, svc_dir: &Path) -> Result<bool>;

    async fn is_down(&self, svc_dir: &Path) -> Result<bool>;

    /// Bring a down service up once, without automatic restarts.
    async fn start(&self, svc_dir: &Path) -> Result<()>;

    /// Wait until the service reports up.
    async fn wait_up(&self, svc_dir: &Path) -> Result<()>;

    /// Wait until any of `svc_dirs` goes down.
    async fn wait_any_down(&self, svc_dirs: &[PathBuf]) -> Result<()>;
}
