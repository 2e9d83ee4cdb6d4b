//! App lifecycle events.
//!
//! Events are fire-and-forget notifications for the higher level
//! orchestration. Consumers deduplicate by content, so posting the same event
//! twice is harmless while losing one is not.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Exit {
        service: String,
        rc: i32,
        signal: i32,
    },
    Running {
        service: String,
    },
}

impl AppEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AppEvent::Exit { .. } => "exit",
            AppEvent::Running { .. } => "running",
        }
    }

    pub fn payload(&self) -> String {
        match self {
            AppEvent::Exit {
                service,
                rc,
                signal,
            } => format!("{service}.{rc}.{signal}"),
            AppEvent::Running { service } => service.clone(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn post(&self, app: &str, event: &AppEvent) -> Result<()>;
}

/// Publishes each event as an empty file named
/// `<timestamp>,<app>,<event type>,<payload>` in a spool directory that an
/// uploader drains.
#[derive(Debug, Clone)]
pub struct DirEventSink {
    dir: PathBuf,
}

impl DirEventSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn event_file_name(app: &str, event: &AppEvent) -> String {
        let now = Utc::now();
        format!(
            "{}.{:03},{app},{},{}",
            now.timestamp(),
            now.timestamp_subsec_millis(),
            event.event_type(),
            event.payload()
        )
    }
}

#[async_trait]
impl EventSink for DirEventSink {
    async fn post(&self, app: &str, event: &AppEvent) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create appevents dir {}", self.dir.display()))?;
        let target = self.dir.join(Self::event_file_name(app, event));
        // Dot-prefixed files are ignored by the uploader until renamed.
        let tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.dir)
            .context("Failed to create temporary event file")?;
        tmp.persist(&target)
            .with_context(|| format!("Failed to publish event {}", target.display()))?;
        debug!("posted event {}", target.display());
        Ok(())
    }
}
