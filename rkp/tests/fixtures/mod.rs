#![allow(dead_code)]

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::{Endpoint, Manifest, ServiceSpec};
use rkp::events::{AppEvent, EventSink};
use rkp::oom::OomProbe;
use rkp::service::{LifecycleTiming, ServicePresence};
use rkp::store::{CoordinationStore, MemoryStore, StoreError};
use rkp::supervisor::Supervisor;

pub fn web_manifest(restart_count: i64) -> Manifest {
    Manifest {
        name: "proid.web#0000000042".to_string(),
        task: Some("0000000042".to_string()),
        identity_group: Some("proid.web-ids".to_string()),
        identity: Some(1),
        endpoints: vec![Endpoint {
            port: 8080,
            real_port: Some(31080),
            name: Some("http".to_string()),
        }],
        services: vec![ServiceSpec {
            name: "web".to_string(),
            restart_count,
        }],
    }
}

pub fn fast_timing() -> LifecycleTiming {
    LifecycleTiming {
        poll_interval: Duration::from_millis(1),
        exit_settle: Duration::from_millis(1),
        attach_timeout: Some(Duration::from_secs(5)),
    }
}

pub fn service_presence(
    container_dir: &Path,
    manifest: Manifest,
    supervisor: Arc<dyn Supervisor>,
    sink: Arc<RecordingSink>,
) -> ServicePresence {
    ServicePresence::new(manifest, container_dir, "node1", supervisor, sink)
        .with_oom_probe(OomProbe::new(container_dir.join("no-cgroup")))
        .with_timing(fast_timing())
}

/// Append a row to the service's finish log the way the supervisor's finish
/// hook does.
pub fn append_exit(svc_dir: &Path, timestamp: i64, rc: i32, signal: i32) {
    fs::create_dir_all(svc_dir).unwrap();
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(svc_dir.join("finished"))
        .unwrap();
    writeln!(f, "{timestamp} {rc} {signal}").unwrap();
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, AppEvent)>>,
}

impl RecordingSink {
    /// Posted events as `<type>,<payload>`.
    pub fn posted(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| format!("{},{}", e.event_type(), e.payload()))
            .collect()
    }

    pub fn apps(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(app, _)| app.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn post(&self, app: &str, event: &AppEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((app.to_string(), event.clone()));
        Ok(())
    }
}

/// Supervisor double keeping up/down state in memory.
///
/// Every `wait_any_down` either crashes the first running service (a row
/// with rc 1 is appended to its finish log) or, once [`kill`] was called,
/// brings the control directory down.
///
/// [`kill`]: ScriptedSupervisor::kill
#[derive(Default)]
pub struct ScriptedSupervisor {
    up: Mutex<HashSet<PathBuf>>,
    starts: AtomicUsize,
    waits: AtomicUsize,
    kill_target: Mutex<Option<PathBuf>>,
}

impl ScriptedSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_up(&self, dir: &Path) {
        self.up.lock().unwrap().insert(dir.to_path_buf());
    }

    pub fn kill(&self, control_dir: &Path) {
        *self.kill_target.lock().unwrap() = Some(control_dir.to_path_buf());
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Supervisor for ScriptedSupervisor {
    async fn is_supervised(&self, _svc_dir: &Path) -> Result<bool> {
        Ok(true)
    }

    async fn is_down(&self, svc_dir: &Path) -> Result<bool> {
        Ok(!self.up.lock().unwrap().contains(svc_dir))
    }

    async fn start(&self, svc_dir: &Path) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.mark_up(svc_dir);
        Ok(())
    }

    async fn wait_up(&self, _svc_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn wait_any_down(&self, svc_dirs: &[PathBuf]) -> Result<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let mut up = self.up.lock().unwrap();
        if let Some(control) = self.kill_target.lock().unwrap().take() {
            up.remove(&control);
            return Ok(());
        }
        if let Some(dir) = svc_dirs.iter().find(|d| up.contains(*d)).cloned() {
            up.remove(&dir);
            append_exit(&dir, Utc::now().timestamp(), 1, 0);
        }
        Ok(())
    }
}

/// Store wrapper counting the deletes that removed something.
pub struct CountingStore {
    inner: MemoryStore,
    deletes: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        CountingStore {
            inner: MemoryStore::new(),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.create_ephemeral(path, value).await
    }

    async fn create(&self, path: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.create(path, value).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.exists(path).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete(path).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_tree(&self, path: &str) -> Result<(), StoreError> {
        let present = self.inner.exists(path).await?;
        self.inner.delete_tree(path).await?;
        if present {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.inner.children(path).await
    }
}
